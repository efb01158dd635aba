use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::codec::{
    read_bytes_u16, read_bytes_u8, read_u8, write_bytes_u16, write_bytes_u8, CodecError,
    CodecResult, Packable,
};

/// Maximum length of a metadata feature.
pub const MAX_METADATA_LEN: usize = 8192;
/// Maximum length of a tag feature.
pub const MAX_TAG_LEN: usize = 64;

/// Optional data attached to an output.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum Feature {
    /// Proven sender of the output.
    Sender(Address),
    /// Proven issuer of an NFT or alias.
    Issuer(Address),
    /// Arbitrary binary data.
    Metadata(Vec<u8>),
    /// Indexation tag.
    Tag(Vec<u8>),
}

impl Feature {
    /// The type byte.
    pub const fn kind(&self) -> u8 {
        match self {
            Feature::Sender(_) => 0,
            Feature::Issuer(_) => 1,
            Feature::Metadata(_) => 2,
            Feature::Tag(_) => 3,
        }
    }
}

impl Packable for Feature {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.kind());
        match self {
            Feature::Sender(a) | Feature::Issuer(a) => a.pack(buf),
            Feature::Metadata(data) => write_bytes_u16(buf, data),
            Feature::Tag(tag) => write_bytes_u8(buf, tag),
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        Ok(match read_u8(buf)? {
            0 => Feature::Sender(Address::unpack(buf)?),
            1 => Feature::Issuer(Address::unpack(buf)?),
            2 => {
                let data = read_bytes_u16(buf)?;
                if data.is_empty() || data.len() > MAX_METADATA_LEN {
                    return Err(CodecError::Invalid(format!(
                        "metadata length {} out of range",
                        data.len()
                    )));
                }
                Feature::Metadata(data)
            }
            3 => Feature::Tag(read_bytes_u8(buf)?),
            kind => {
                return Err(CodecError::UnknownKind {
                    what: "feature",
                    kind,
                })
            }
        })
    }
}

/// Features of an output, sorted by kind, one per kind.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct Features(Vec<Feature>);

impl Features {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `feature`, replacing one of the same kind.
    pub fn upsert(&mut self, feature: Feature) {
        match self.0.binary_search_by_key(&feature.kind(), Feature::kind) {
            Ok(i) => self.0[i] = feature,
            Err(i) => self.0.insert(i, feature),
        }
    }

    /// Builder-style [`Self::upsert`].
    pub fn with(mut self, feature: Feature) -> Self {
        self.upsert(feature);
        self
    }

    /// Whether no feature is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates features in kind order.
    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.0.iter()
    }

    /// The sender feature.
    pub fn sender(&self) -> Option<&Address> {
        self.0.iter().find_map(|f| match f {
            Feature::Sender(a) => Some(a),
            _ => None,
        })
    }

    /// The issuer feature.
    pub fn issuer(&self) -> Option<&Address> {
        self.0.iter().find_map(|f| match f {
            Feature::Issuer(a) => Some(a),
            _ => None,
        })
    }

    /// The metadata feature.
    pub fn metadata(&self) -> Option<&[u8]> {
        self.0.iter().find_map(|f| match f {
            Feature::Metadata(d) => Some(d.as_slice()),
            _ => None,
        })
    }
}

impl FromIterator<Feature> for Features {
    fn from_iter<T: IntoIterator<Item = Feature>>(iter: T) -> Self {
        let mut ret = Self::new();
        for f in iter {
            ret.upsert(f);
        }
        ret
    }
}

impl Packable for Features {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.0.len() as u8);
        for f in &self.0 {
            f.pack(buf);
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let count = read_u8(buf)?;
        let mut ret: Vec<Feature> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let f = Feature::unpack(buf)?;
            if ret.last().is_some_and(|l| l.kind() >= f.kind()) {
                return Err(CodecError::NotCanonical { what: "features" });
            }
            ret.push(f);
        }
        Ok(Self(ret))
    }
}
