/*!
Data block en mémoire

Reproduit la disposition d'un DB automate: valeurs big-endian à des offsets
d'octets fixes, booléens adressés par octet + bit (0..7).
*/

/// Image mémoire d'un data block, construite par les tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    bytes: Vec<u8>,
}

impl DataBlock {
    /// Crée un data block rempli de zéros
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size] }
    }

    /// Crée un data block à partir d'octets bruts
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Écrit un REAL (IEEE-754 32 bits big-endian)
    pub fn set_real(&mut self, offset: usize, value: f32) -> &mut Self {
        self.write(offset, &value.to_be_bytes())
    }

    /// Écrit un INT (16 bits signé big-endian)
    pub fn set_int(&mut self, offset: usize, value: i16) -> &mut Self {
        self.write(offset, &value.to_be_bytes())
    }

    /// Positionne un bit (0..7) dans l'octet donné
    pub fn set_bit(&mut self, byte: usize, bit: u8, value: bool) -> &mut Self {
        assert!(bit < 8, "bit index must be 0..7, got {bit}");
        self.ensure(byte + 1);
        if value {
            self.bytes[byte] |= 1 << bit;
        } else {
            self.bytes[byte] &= !(1 << bit);
        }
        self
    }

    /// Écrit des octets bruts
    pub fn set_bytes(&mut self, offset: usize, raw: &[u8]) -> &mut Self {
        self.write(offset, raw)
    }

    /// Lit une plage, `None` si hors du block
    pub fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.bytes.get(offset..offset.checked_add(len)?)
    }

    fn write(&mut self, offset: usize, raw: &[u8]) -> &mut Self {
        self.ensure(offset + raw.len());
        self.bytes[offset..offset + raw.len()].copy_from_slice(raw);
        self
    }

    // Le block grandit si un test écrit au-delà de sa taille initiale
    fn ensure(&mut self, len: usize) {
        if self.bytes.len() < len {
            self.bytes.resize(len, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_is_big_endian() {
        let mut db = DataBlock::new(8);
        db.set_real(4, 50.0);
        assert_eq!(db.slice(4, 4).unwrap(), &[0x42, 0x48, 0x00, 0x00]);
    }

    #[test]
    fn test_int_and_bits() {
        let mut db = DataBlock::new(4);
        db.set_int(0, -2).set_bit(3, 3, true).set_bit(3, 0, true).set_bit(3, 0, false);
        assert_eq!(db.bytes(), &[0xFF, 0xFE, 0x00, 0b0000_1000]);
    }

    #[test]
    fn test_grows_and_bounds() {
        let mut db = DataBlock::new(2);
        db.set_real(10, 1.0);
        assert_eq!(db.len(), 14);
        assert!(db.slice(12, 4).is_none());
        assert!(db.slice(usize::MAX, 2).is_none());
    }
}
