//! rkyv encoding for records persisted in sled.

/// Implement `to_bytes`/`from_bytes` for an rkyv-archivable type.
///
/// sled hands back values without any alignment guarantee, so decoding copies
/// into an aligned buffer before validating the archive.
macro_rules! impl_rkyv_codec {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $ty {
                /// Serialize to bytes.
                pub fn to_bytes(&self) -> Result<Vec<u8>, crate::error::Error> {
                    rkyv::to_bytes::<rkyv::rancor::Error>(self)
                        .map(|v| v.to_vec())
                        .map_err(|e| crate::error::Error::Serialization(e.to_string()))
                }

                /// Deserialize from bytes.
                pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::error::Error> {
                    let mut aligned = rkyv::util::AlignedVec::<16>::new();
                    aligned.extend_from_slice(bytes);
                    rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
                        .map_err(|e| crate::error::Error::Deserialization(e.to_string()))
                }
            }
        )+
    };
}

pub(crate) use impl_rkyv_codec;
