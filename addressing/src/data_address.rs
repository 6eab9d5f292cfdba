//! Este modulo implementa DataAddress: una direccion de 124 bits
//! compuesta por un BlockId (108 bits altos) y un data_id de 14 bits
//! (bits bajos, rango [0, 16384)).
use crate::block_id::BlockId;
use std::fmt;
use std::str::FromStr;

/// Cantidad maxima de nodos direccionables dentro de un mismo bloque.
pub const DATA_IDS_PER_BLOCK: u32 = 16384;
const DATA_ID_BITS: u32 = 14;

/// Direccion de un slot de nodo dentro de un bloque.
///
/// Ordenada por el valor de 128 bits subyacente: primero por block_id,
/// luego por data_id.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct DataAddress(u128);

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidDataId(pub u32);

impl DataAddress {
    /// Empaqueta `data_id` (debe ser < 16384) en los bits bajos de
    /// `block_id`.
    pub fn from(block_id: BlockId, data_id: u16) -> Result<Self, InvalidDataId> {
        if data_id as u32 >= DATA_IDS_PER_BLOCK {
            return Err(InvalidDataId(data_id as u32));
        }
        let packed = block_id.clear_low_bits(DATA_ID_BITS).with_low_bits(data_id as u128, DATA_ID_BITS);
        Ok(DataAddress(packed.value()))
    }

    pub fn block_id(&self) -> BlockId {
        BlockId::new(self.0).clear_low_bits(DATA_ID_BITS)
    }

    pub fn data_id(&self) -> u16 {
        (self.0 & ((1u128 << DATA_ID_BITS) - 1)) as u16
    }

    pub fn value(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for DataAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.block_id(), self.data_id())
    }
}

#[derive(Debug)]
pub struct ParseDataAddressError;

impl FromStr for DataAddress {
    type Err = ParseDataAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (block_part, data_part) = s.split_once('.').ok_or(ParseDataAddressError)?;
        let block_id: u128 = block_part.parse().map_err(|_| ParseDataAddressError)?;
        let data_id: u16 = data_part.parse().map_err(|_| ParseDataAddressError)?;
        DataAddress::from(BlockId::new(block_id), data_id).map_err(|_| ParseDataAddressError)
    }
}
