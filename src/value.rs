//! Values recording the outcome of a unit of work, as persisted in the
//! result database.

use crate::fs::{FileInfo, StatInfo};
use anyhow::bail;

/// The persisted outcome of building one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildValue {
    /// Placeholder for not-yet-computed results; never persisted.
    Invalid,
    /// A virtual node was "produced".
    VirtualInput,
    /// A filesystem node exists, with its identity at production time.
    ExistingInput(FileInfo),
    /// A node used as an input has no filesystem backing and no producer.
    MissingInput,
    /// An input derived from a failed or skipped upstream command.
    FailedInput,
    /// A command ran to completion; carries the signature it ran under and
    /// per-output file identities (missing markers for virtual outputs).
    SuccessfulCommand {
        signature: u64,
        outputs: Vec<FileInfo>,
    },
    FailedCommand,
    SkippedCommand,
    /// A target was traversed.  Never accepted as valid on reload, so
    /// targets re-traverse every build.
    Target,
}

const TAG_INVALID: u8 = 0;
const TAG_VIRTUAL_INPUT: u8 = 1;
const TAG_EXISTING_INPUT: u8 = 2;
const TAG_MISSING_INPUT: u8 = 3;
const TAG_FAILED_INPUT: u8 = 4;
const TAG_SUCCESSFUL_COMMAND: u8 = 5;
const TAG_FAILED_COMMAND: u8 = 6;
const TAG_SKIPPED_COMMAND: u8 = 7;
const TAG_TARGET: u8 = 8;

impl BuildValue {
    pub fn is_invalid(&self) -> bool {
        matches!(self, BuildValue::Invalid)
    }

    /// Whether this value is the scalar result of a single node, as opposed
    /// to a whole-command or whole-target result.
    pub fn is_node_value(&self) -> bool {
        matches!(
            self,
            BuildValue::VirtualInput
                | BuildValue::ExistingInput(_)
                | BuildValue::MissingInput
                | BuildValue::FailedInput
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Vec::new();
        match self {
            BuildValue::Invalid => w.push(TAG_INVALID),
            BuildValue::VirtualInput => w.push(TAG_VIRTUAL_INPUT),
            BuildValue::ExistingInput(info) => {
                w.push(TAG_EXISTING_INPUT);
                write_file_info(&mut w, info);
            }
            BuildValue::MissingInput => w.push(TAG_MISSING_INPUT),
            BuildValue::FailedInput => w.push(TAG_FAILED_INPUT),
            BuildValue::SuccessfulCommand { signature, outputs } => {
                w.push(TAG_SUCCESSFUL_COMMAND);
                w.extend_from_slice(&signature.to_le_bytes());
                w.extend_from_slice(&(outputs.len() as u32).to_le_bytes());
                for info in outputs {
                    write_file_info(&mut w, info);
                }
            }
            BuildValue::FailedCommand => w.push(TAG_FAILED_COMMAND),
            BuildValue::SkippedCommand => w.push(TAG_SKIPPED_COMMAND),
            BuildValue::Target => w.push(TAG_TARGET),
        }
        w
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<BuildValue> {
        let mut r = Reader { buf: bytes, ofs: 0 };
        let value = match r.u8()? {
            TAG_INVALID => BuildValue::Invalid,
            TAG_VIRTUAL_INPUT => BuildValue::VirtualInput,
            TAG_EXISTING_INPUT => BuildValue::ExistingInput(r.file_info()?),
            TAG_MISSING_INPUT => BuildValue::MissingInput,
            TAG_FAILED_INPUT => BuildValue::FailedInput,
            TAG_SUCCESSFUL_COMMAND => {
                let signature = r.u64()?;
                let count = r.u32()? as usize;
                let mut outputs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    outputs.push(r.file_info()?);
                }
                BuildValue::SuccessfulCommand { signature, outputs }
            }
            TAG_FAILED_COMMAND => BuildValue::FailedCommand,
            TAG_SKIPPED_COMMAND => BuildValue::SkippedCommand,
            TAG_TARGET => BuildValue::Target,
            tag => bail!("unknown build value tag {:#x}", tag),
        };
        r.expect_end()?;
        Ok(value)
    }
}

const INFO_MISSING: u8 = 0;
const INFO_STAT: u8 = 1;

fn write_file_info(w: &mut Vec<u8>, info: &FileInfo) {
    match info {
        FileInfo::Missing => w.push(INFO_MISSING),
        FileInfo::Stat(stat) => {
            w.push(INFO_STAT);
            w.extend_from_slice(&stat.device.to_le_bytes());
            w.extend_from_slice(&stat.inode.to_le_bytes());
            w.extend_from_slice(&stat.mode.to_le_bytes());
            w.extend_from_slice(&stat.size.to_le_bytes());
            w.extend_from_slice(&stat.mtime.to_le_bytes());
            w.extend_from_slice(&stat.mtime_nsec.to_le_bytes());
        }
    }
}

/// Provides lower-level methods for reading serialized data.
struct Reader<'a> {
    buf: &'a [u8],
    ofs: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        let Some(bytes) = self.buf.get(self.ofs..self.ofs + n) else {
            bail!("truncated build value");
        };
        self.ofs += n;
        Ok(bytes)
    }
    fn u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.bytes(1)?[0])
    }
    fn u32(&mut self) -> anyhow::Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> anyhow::Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> anyhow::Result<i64> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
    fn file_info(&mut self) -> anyhow::Result<FileInfo> {
        match self.u8()? {
            INFO_MISSING => Ok(FileInfo::Missing),
            INFO_STAT => Ok(FileInfo::Stat(StatInfo {
                device: self.u64()?,
                inode: self.u64()?,
                mode: self.u32()?,
                size: self.u64()?,
                mtime: self.i64()?,
                mtime_nsec: self.i64()?,
            })),
            flag => bail!("unknown file info flag {:#x}", flag),
        }
    }
    fn expect_end(&self) -> anyhow::Result<()> {
        if self.ofs != self.buf.len() {
            bail!("trailing bytes after build value");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stat() -> FileInfo {
        FileInfo::Stat(StatInfo {
            device: 64769,
            inode: 9130432,
            mode: 0o100644,
            size: 4096,
            mtime: 1700000000,
            mtime_nsec: 123456789,
        })
    }

    #[test]
    fn round_trip_all_variants() {
        let values = [
            BuildValue::Invalid,
            BuildValue::VirtualInput,
            BuildValue::ExistingInput(sample_stat()),
            BuildValue::MissingInput,
            BuildValue::FailedInput,
            BuildValue::SuccessfulCommand {
                signature: 0xdead_beef_cafe_f00d,
                outputs: vec![sample_stat(), FileInfo::Missing],
            },
            BuildValue::SuccessfulCommand {
                signature: 0,
                outputs: vec![],
            },
            BuildValue::FailedCommand,
            BuildValue::SkippedCommand,
            BuildValue::Target,
        ];
        for value in values {
            let bytes = value.encode();
            let decoded = BuildValue::decode(&bytes).unwrap();
            assert_eq!(decoded, value);
            // Canonical bytes re-encode identically.
            assert_eq!(decoded.encode(), bytes);
        }
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(BuildValue::decode(&[0xff]).is_err());
    }

    #[test]
    fn rejects_truncated_body() {
        let mut bytes = BuildValue::SuccessfulCommand {
            signature: 1,
            outputs: vec![sample_stat()],
        }
        .encode();
        bytes.truncate(bytes.len() - 3);
        assert!(BuildValue::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = BuildValue::Target.encode();
        bytes.push(0);
        assert!(BuildValue::decode(&bytes).is_err());
    }
}
