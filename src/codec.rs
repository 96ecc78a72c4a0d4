//! Fixed-width little-endian records read from and written to absolute
//! offsets of a disk image. Field order and width are the wire format.

use super::*;
use blk_dev::DiskDevice;

use serde::{de::DeserializeOwned, Serialize};

pub trait DiskRecord: Serialize + DeserializeOwned {
    /// encoded size in bytes
    const SIZE: usize;
    /// name used in error reports
    const ENTITY: &'static str;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self).map_err(|e| FsError::Malformed {
            entity: Self::ENTITY,
            offset: 0,
            reason: e.to_string(),
        })?;
        if bytes.len() != Self::SIZE {
            return Err(FsError::Malformed {
                entity: Self::ENTITY,
                offset: 0,
                reason: format!("encoded {} bytes, expected {}", bytes.len(), Self::SIZE),
            });
        }
        Ok(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(FsError::Malformed {
                entity: Self::ENTITY,
                offset: 0,
                reason: format!("{} bytes, expected {}", bytes.len(), Self::SIZE),
            });
        }
        bincode::deserialize(&bytes[..Self::SIZE]).map_err(|e| FsError::Malformed {
            entity: Self::ENTITY,
            offset: 0,
            reason: e.to_string(),
        })
    }

    fn read_from(dev: &dyn DiskDevice, offset: u64) -> Result<Self> {
        let mut buf = vec![0u8; Self::SIZE];
        dev.read_at(offset, &mut buf)
            .map_err(|e| FsError::io(Self::ENTITY, offset, e))?;
        Self::from_bytes(&buf).map_err(|e| at_offset(e, offset))
    }

    fn write_to(&self, dev: &dyn DiskDevice, offset: u64) -> Result<()> {
        let bytes = self.to_bytes().map_err(|e| at_offset(e, offset))?;
        log::trace!("write {} ({} bytes) at {}", Self::ENTITY, bytes.len(), offset);
        dev.write_at(offset, &bytes)
            .map_err(|e| FsError::io(Self::ENTITY, offset, e))
    }
}

fn at_offset(err: FsError, at: u64) -> FsError {
    match err {
        FsError::Malformed { entity, reason, .. } => FsError::Malformed {
            entity,
            offset: at,
            reason,
        },
        other => other,
    }
}

/// Wire offsets are signed 32-bit; refuse anything negative before seeking.
pub fn offset(entity: &'static str, pos: i64) -> Result<u64> {
    u64::try_from(pos).map_err(|_| FsError::Malformed {
        entity,
        offset: 0,
        reason: format!("negative offset {}", pos),
    })
}

/// Byte arrays wider than serde's built-in 32, encoded as a bare tuple.
pub mod fixed_bytes {
    use serde::de::{Error, SeqAccess, Visitor};
    use serde::ser::SerializeTuple;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(N)?;
        for b in bytes {
            tup.serialize_element(b)?;
        }
        tup.end()
    }

    struct ArrayVisitor<const N: usize>;

    impl<'de, const N: usize> Visitor<'de> for ArrayVisitor<N> {
        type Value = [u8; N];

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "{} bytes", N)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = [0u8; N];
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(i, &self))?;
            }
            Ok(out)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        deserializer.deserialize_tuple(N, ArrayVisitor::<N>)
    }
}
