use crate::alloc::Bitmap;
use crate::fs::{FsError, Result};
use crate::tree::Namespace;
use fileblock::Geometry;
use serde::{Deserialize, Serialize};
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

const HEADER_MAGIC: u32 = 0x4346_5348; // CFSH
const FORMAT_VERSION: u32 = 1;

/// Size of the fixed preamble at container offset 0.
pub const PREAMBLE_LEN: usize = 32;

/// Fixed-layout start of the header region. Everything after it, up to
/// `payload_len` bytes, is the bincode image of the bitmap and namespace; the
/// rest of the region is zero.
///
/// ```text
/// | magic | version | block_size | header_size | total_size | payload_len | reserved |
/// |  u32  |   u32   |    u32     |     u32     |    u64     |     u32     |   u32    |
/// ```
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
struct Preamble {
    magic: U32<BigEndian>,
    version: U32<BigEndian>,
    block_size: U32<BigEndian>,
    header_size: U32<BigEndian>,
    total_size: U64<BigEndian>,
    payload_len: U32<BigEndian>,
    reserved: U32<BigEndian>,
}

impl Preamble {
    fn new(geometry: &Geometry, payload_len: usize) -> Self {
        Self {
            magic: U32::new(HEADER_MAGIC),
            version: U32::new(FORMAT_VERSION),
            block_size: U32::new(geometry.block_size() as u32),
            header_size: U32::new(geometry.header_size() as u32),
            total_size: U64::new(geometry.total_size()),
            payload_len: U32::new(payload_len as u32),
            reserved: U32::new(0),
        }
    }

    fn check(&self, geometry: &Geometry) -> Result<()> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(FsError::InvalidHeader(format!(
                "bad magic {:#010x}",
                self.magic.get()
            )));
        }
        if self.version.get() != FORMAT_VERSION {
            return Err(FsError::InvalidHeader(format!(
                "unsupported format version {}",
                self.version.get()
            )));
        }
        if self.block_size.get() as usize != geometry.block_size()
            || self.header_size.get() as usize != geometry.header_size()
            || self.total_size.get() != geometry.total_size()
        {
            return Err(FsError::InvalidHeader(format!(
                "image was written for block={} header={} total={}",
                self.block_size.get(),
                self.header_size.get(),
                self.total_size.get()
            )));
        }
        if PREAMBLE_LEN + self.payload_len.get() as usize > geometry.header_size() {
            return Err(FsError::InvalidHeader(format!(
                "payload of {} bytes overruns the header region",
                self.payload_len.get()
            )));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ImageRef<'a> {
    bitmap: &'a Bitmap,
    namespace: &'a Namespace,
}

#[derive(Deserialize)]
struct Image {
    bitmap: Bitmap,
    namespace: Namespace,
}

/// Encodes the full header region, null-padded to `header_size`. Fails with
/// [`FsError::HeaderOverflow`] without producing anything when the image does
/// not fit.
pub fn encode(geometry: &Geometry, bitmap: &Bitmap, namespace: &Namespace) -> Result<Vec<u8>> {
    let payload = bincode::serialize(&ImageRef { bitmap, namespace })?;
    let needed = PREAMBLE_LEN + payload.len();
    let capacity = geometry.header_size();
    if needed > capacity {
        return Err(FsError::HeaderOverflow { needed, capacity });
    }

    let mut region = Vec::with_capacity(capacity);
    region.extend_from_slice(Preamble::new(geometry, payload.len()).as_bytes());
    region.extend_from_slice(&payload);
    region.resize(capacity, 0);
    Ok(region)
}

/// Decodes a header region produced by [`encode`].
pub fn decode(geometry: &Geometry, region: &[u8]) -> Result<(Bitmap, Namespace)> {
    let preamble = Preamble::read_from_prefix(region)
        .ok_or_else(|| FsError::InvalidHeader("header region is too short".to_string()))?;
    preamble.check(geometry)?;
    let end = PREAMBLE_LEN + preamble.payload_len.get() as usize;
    let payload = region
        .get(PREAMBLE_LEN..end)
        .ok_or_else(|| FsError::InvalidHeader("payload is truncated".to_string()))?;
    let image: Image = bincode::deserialize(payload)?;
    if image.namespace.dir(image.namespace.root()).is_none() {
        return Err(FsError::InvalidHeader("image has no root directory".to_string()));
    }
    image.namespace.check_shape()?;
    Ok((image.bitmap, image.namespace))
}
