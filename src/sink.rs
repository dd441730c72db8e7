//! Per-channel sample files
//!
//! Channel files are opened in append mode once per session. Running again with
//! the same prefix adds to whatever is already there, so a fresh capture needs a
//! fresh prefix (or the old files removed first).

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
};

use byte_slice_cast::AsByteSlice;
use tracing::{debug, info};

use crate::{metadata::RunMetadata, sample::Sample, stream::SampleBlock, Error, Result};

pub fn channel_path(prefix: &str, chan: usize) -> PathBuf {
    PathBuf::from(format!("{prefix}_chan{chan}.bin"))
}

pub fn metadata_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}_metadata.txt"))
}

pub struct ChannelSink {
    prefix: String,
    files: Vec<File>,
    bytes: Vec<u64>,
}

impl ChannelSink {
    pub fn open(prefix: &str, channels: usize) -> Result<Self> {
        let mut files = Vec::with_capacity(channels);
        for chan in 0..channels {
            let path = channel_path(prefix, chan);
            debug!("Opening {}", path.display());
            files.push(OpenOptions::new().create(true).append(true).open(path)?);
        }
        Ok(Self {
            prefix: prefix.to_owned(),
            files,
            bytes: vec![0; channels],
        })
    }

    /// Write (replacing any earlier one) the metadata document for this prefix
    pub fn write_metadata(&self, metadata: &RunMetadata) -> Result<PathBuf> {
        let path = metadata_path(&self.prefix);
        let mut file = File::create(&path)?;
        file.write_all(metadata.to_string().as_bytes())?;
        file.flush()?;
        info!("Wrote metadata to {}", path.display());
        Ok(path)
    }

    /// Append a block's raw samples to its channel file
    pub fn write_block<T: Sample>(&mut self, block: &SampleBlock<'_, T>) -> Result<()> {
        let file = self.files.get_mut(block.channel).ok_or_else(|| {
            Error::Configuration(format!("no output file for channel {}", block.channel))
        })?;
        let bytes = block.data.as_byte_slice();
        file.write_all(bytes)?;
        file.flush()?;
        self.bytes[block.channel] += bytes.len() as u64;
        Ok(())
    }

    /// Bytes written through this sink, per channel
    pub fn bytes_written(&self) -> &[u64] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_paths() {
        assert_eq!(channel_path("run/a", 3), PathBuf::from("run/a_chan3.bin"));
        assert_eq!(metadata_path("x"), PathBuf::from("x_metadata.txt"));
    }

    #[test]
    fn test_blocks_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("cap").to_string_lossy().into_owned();
        let first = [1i16, 2, 3, 4];
        let second = [5i16, 6];
        {
            let mut sink = ChannelSink::open(&prefix, 2).unwrap();
            sink.write_block(&SampleBlock {
                channel: 1,
                samples: 2,
                data: &first,
            })
            .unwrap();
            sink.write_block(&SampleBlock {
                channel: 1,
                samples: 1,
                data: &second,
            })
            .unwrap();
            assert_eq!(sink.bytes_written(), &[0, 12]);
        }
        let bytes = fs::read(channel_path(&prefix, 1)).unwrap();
        let expected: Vec<u8> = first
            .iter()
            .chain(&second)
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        assert_eq!(bytes, expected);
        assert_eq!(fs::metadata(channel_path(&prefix, 0)).unwrap().len(), 0);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("cap").to_string_lossy().into_owned();
        let data = [0.5f32, -0.5];
        for _ in 0..2 {
            let mut sink = ChannelSink::open(&prefix, 1).unwrap();
            sink.write_block(&SampleBlock {
                channel: 0,
                samples: 1,
                data: &data,
            })
            .unwrap();
        }
        assert_eq!(fs::metadata(channel_path(&prefix, 0)).unwrap().len(), 16);
    }

    #[test]
    fn test_unknown_channel() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("cap").to_string_lossy().into_owned();
        let mut sink = ChannelSink::open(&prefix, 1).unwrap();
        let block = SampleBlock {
            channel: 4,
            samples: 0,
            data: &[] as &[i16],
        };
        assert!(sink.write_block(&block).is_err());
    }
}
