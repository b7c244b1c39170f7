use anyhow::{Context as _, Result, bail};
use std::io::{Read as _, Write};
use strum::{AsRefStr, EnumString, FromRepr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, FromRepr)]
#[repr(u8)]
pub enum CompressionMethod {
    None = 0,
    Zlib = 1,
    Lz4 = 2,
}

pub fn compress<S: Write>(compression: CompressionMethod, input: &[u8], mut output: S) -> Result<()> {
    match compression {
        CompressionMethod::None => output.write_all(input)?,
        CompressionMethod::Zlib => {
            let mut encoder = flate2::write::ZlibEncoder::new(output, flate2::Compression::best());
            encoder.write_all(input)?;
            encoder.finish()?;
        }
        CompressionMethod::Lz4 => output.write_all(&lz4_flex::compress(input))?,
    }
    Ok(())
}

/// Decompresses into `output`, whose length must be the exact uncompressed size
pub fn decompress(compression: CompressionMethod, input: &[u8], output: &mut [u8]) -> Result<()> {
    match compression {
        CompressionMethod::None => {
            if input.len() != output.len() {
                bail!("stored block is {} bytes, expected {}", input.len(), output.len());
            }
            output.copy_from_slice(input);
        }
        CompressionMethod::Zlib => {
            flate2::read::ZlibDecoder::new(input).read_exact(output).context("zlib decompression failed")?;
        }
        CompressionMethod::Lz4 => {
            let written = lz4_flex::decompress_into(input, output).context("lz4 decompression failed")?;
            if written != output.len() {
                bail!("lz4 decompression failed: expected {} output bytes, got {}", output.len(), written);
            }
        }
    }
    Ok(())
}
