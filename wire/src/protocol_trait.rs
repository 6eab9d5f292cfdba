//! Traits de (de)serializacion para el protocolo interno del cluster
//! de control. Analogos a SerializeRIP/DeserializeRIP pero con nombre
//! propio para este protocolo.
use std::io::Read;

pub trait SerializeWire {
    fn serialize(&self) -> Vec<u8>;
}

pub trait DeserializeWire {
    fn deserialize<T: Read>(stream: &mut T) -> std::io::Result<Self>
    where
        Self: Sized;
}

pub fn read_exact<const N: usize, T: Read>(stream: &mut T) -> std::io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}
