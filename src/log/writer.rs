use crc32c::{crc32c, crc32c_append, crc32c_combine};
use log::warn;

use super::{
    RecordType, BLOCK_SIZE, HEADER_SIZE, LOG_PADDING, MAX_RECORD_TYPE, RECYCLABLE_HEADER_SIZE,
};
use crate::common::{Error, Result, WritableFileWriter};
use crate::util;

/// Frames byte records into CRC-protected physical records across fixed
/// 32KiB blocks and drives the file writer beneath it. When fewer than a
/// header's worth of bytes remain in a block, the gap is zero-filled and
/// the record starts in the next block, so a reader can always fetch a
/// whole header from a block prefix.
pub struct LogWriter {
    dest: Option<Box<WritableFileWriter>>,
    block_offset: usize,
    log_number: u64,
    recycle_log_files: bool,
    // When set, the owner batches flushes through write_buffer().
    manual_flush: bool,
    type_crc: [u32; MAX_RECORD_TYPE as usize + 1],
}

impl LogWriter {
    pub fn new(
        dest: Box<WritableFileWriter>,
        log_number: u64,
        recycle_log_files: bool,
        manual_flush: bool,
    ) -> Self {
        let mut type_crc = [0u32; MAX_RECORD_TYPE as usize + 1];
        for (i, crc) in type_crc.iter_mut().enumerate() {
            *crc = crc32c(&[i as u8]);
        }
        LogWriter {
            dest: Some(dest),
            block_offset: 0,
            log_number,
            recycle_log_files,
            manual_flush,
            type_crc,
        }
    }

    pub fn get_file_mut(&mut self) -> Option<&mut WritableFileWriter> {
        self.dest.as_deref_mut()
    }

    pub fn get_file_size(&self) -> u64 {
        self.dest.as_ref().map(|d| d.file_size()).unwrap_or(0)
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub async fn add_record(&mut self, record: &[u8]) -> Result<()> {
        let header_size = if self.recycle_log_files {
            RECYCLABLE_HEADER_SIZE
        } else {
            HEADER_SIZE
        };
        let mut left = record.len();
        let mut offset = 0usize;
        let mut begin = true;
        // Fragment the record if necessary. Even an empty record iterates
        // once, emitting a single zero-length physical record.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < header_size {
                // Switch to a new block, zero-filling the trailer.
                if leftover > 0 {
                    self.dest_mut()?.append(&LOG_PADDING[..leftover]).await?;
                }
                self.block_offset = 0;
            }
            debug_assert!(BLOCK_SIZE - self.block_offset >= header_size);

            let avail = BLOCK_SIZE - self.block_offset - header_size;
            let fragment_length = std::cmp::min(left, avail);
            let end = left == fragment_length;
            let record_type = if begin && end {
                if self.recycle_log_files {
                    RecordType::RecyclableFullType
                } else {
                    RecordType::FullType
                }
            } else if begin {
                if self.recycle_log_files {
                    RecordType::RecyclableFirstType
                } else {
                    RecordType::FirstType
                }
            } else if end {
                if self.recycle_log_files {
                    RecordType::RecyclableLastType
                } else {
                    RecordType::LastType
                }
            } else if self.recycle_log_files {
                RecordType::RecyclableMiddleType
            } else {
                RecordType::MiddleType
            };

            self.emit_physical_record(record_type, &record[offset..offset + fragment_length])
                .await?;
            offset += fragment_length;
            left -= fragment_length;
            begin = false;
            if left == 0 {
                break;
            }
        }
        if !self.manual_flush {
            self.dest_mut()?.flush().await?;
        }
        Ok(())
    }

    /// Flushes the underlying file writer's buffer.
    pub async fn write_buffer(&mut self) -> Result<()> {
        self.dest_mut()?.flush().await
    }

    pub async fn close(&mut self) -> Result<()> {
        match self.dest.take() {
            Some(mut dest) => dest.close().await,
            None => Ok(()),
        }
    }

    async fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xffff);
        let mut buf = [0u8; RECYCLABLE_HEADER_SIZE];
        buf[4] = (data.len() & 0xff) as u8;
        buf[5] = (data.len() >> 8) as u8;
        buf[6] = record_type as u8;

        let mut crc = self.type_crc[record_type as usize];
        let header_size = if record_type.is_recyclable() {
            debug_assert!(self.block_offset + RECYCLABLE_HEADER_SIZE + data.len() <= BLOCK_SIZE);
            // Only the low 32 bits of the log number go on disk. Missing
            // an old record would take the same file recycled ~4 billion
            // times; the 32-bit CRC would give out first.
            buf[7..11].copy_from_slice(&(self.log_number as u32).to_le_bytes());
            crc = crc32c_append(crc, &buf[7..11]);
            RECYCLABLE_HEADER_SIZE
        } else {
            debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);
            HEADER_SIZE
        };

        // Combine with the payload CRC instead of rescanning the payload;
        // the same CRC doubles as the handoff checksum below.
        let payload_crc = crc32c(data);
        crc = crc32c_combine(crc, payload_crc, data.len());
        crc = util::crc_mask(crc);
        buf[..4].copy_from_slice(&crc.to_le_bytes());

        let dest = self.dest_mut()?;
        dest.append(&buf[..header_size]).await?;
        dest.append_with_checksum(data, payload_crc).await?;
        self.block_offset += header_size + data.len();
        Ok(())
    }

    fn dest_mut(&mut self) -> Result<&mut WritableFileWriter> {
        match self.dest.as_deref_mut() {
            Some(d) => Ok(d),
            None => Err(Error::Closed("log writer has been closed".to_string())),
        }
    }

    #[cfg(test)]
    pub(crate) fn test_block_offset(&self) -> usize {
        self.block_offset
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Some(dest) = self.dest.as_mut() {
            if let Err(e) = futures::executor::block_on(dest.flush()) {
                warn!("failed to flush log file {} on drop: {}", dest.file_name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::file_system::InMemFileSystem;
    use crate::options::WriterOptions;
    use crate::util::{crc_unmask, decode_fixed_uint16, decode_fixed_uint32};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use tokio::runtime::Runtime;

    fn new_log_writer(
        fs: &InMemFileSystem,
        name: &str,
        log_number: u64,
        recycle: bool,
        manual_flush: bool,
    ) -> LogWriter {
        let opts = WriterOptions::default();
        let f = fs.open_file(name, &opts);
        let writer = WritableFileWriter::new(Box::new(f), name.to_string(), &opts);
        LogWriter::new(Box::new(writer), log_number, recycle, manual_flush)
    }

    // Walks the emitted blocks, checks every stored CRC, and reassembles
    // the logical records from the FULL/FIRST/MIDDLE/LAST chain.
    fn parse_records(content: &[u8], recyclable: bool) -> Vec<Vec<u8>> {
        let header_size = if recyclable {
            RECYCLABLE_HEADER_SIZE
        } else {
            HEADER_SIZE
        };
        let mut records = vec![];
        let mut current: Vec<u8> = vec![];
        let mut pos = 0usize;
        while pos < content.len() {
            let block_end = (pos / BLOCK_SIZE + 1) * BLOCK_SIZE;
            if block_end - pos < header_size {
                assert!(content[pos..block_end.min(content.len())]
                    .iter()
                    .all(|b| *b == 0));
                pos = block_end;
                continue;
            }
            assert!(pos + header_size <= content.len());
            let header = &content[pos..pos + header_size];
            let length = decode_fixed_uint16(&header[4..6]) as usize;
            let tp = header[6];
            let payload = &content[pos + header_size..pos + header_size + length];

            let stored = crc_unmask(decode_fixed_uint32(&header[..4]));
            let mut expected = crc32c(&[tp]);
            if recyclable {
                expected = crc32c_append(expected, &header[7..11]);
            }
            expected = crc32c_append(expected, payload);
            assert_eq!(stored, expected);

            match tp {
                1 | 5 => records.push(payload.to_vec()),
                2 | 6 => current = payload.to_vec(),
                3 | 7 => current.extend_from_slice(payload),
                4 | 8 => {
                    current.extend_from_slice(payload);
                    records.push(std::mem::take(&mut current));
                }
                _ => panic!("unexpected record type {}", tp),
            }
            pos += header_size + length;
        }
        records
    }

    #[test]
    fn test_single_full_record() {
        let fs = InMemFileSystem::default();
        let mut log = new_log_writer(&fs, "wal", 0, false, false);
        let r = Runtime::new().unwrap();
        r.block_on(log.add_record(b"hello")).unwrap();
        assert_eq!(log.test_block_offset(), 12);
        assert_eq!(log.get_file_size(), 12);

        let content = fs.file_content("wal").unwrap();
        assert_eq!(content.len(), 12);
        let expected_crc = crc32c_append(crc32c(&[RecordType::FullType as u8]), b"hello");
        assert_eq!(crc_unmask(decode_fixed_uint32(&content[..4])), expected_crc);
        assert_eq!(&content[4..6], &[0x05, 0x00]);
        assert_eq!(content[6], RecordType::FullType as u8);
        assert_eq!(&content[7..], b"hello");
    }

    #[test]
    fn test_block_trailer_padding() {
        let fs = InMemFileSystem::default();
        let mut log = new_log_writer(&fs, "wal", 0, false, false);
        let r = Runtime::new().unwrap();
        // Land exactly 6 bytes short of the block boundary, too few for
        // another header.
        let first = vec![42u8; BLOCK_SIZE - HEADER_SIZE - 6];
        r.block_on(log.add_record(&first)).unwrap();
        assert_eq!(log.test_block_offset(), BLOCK_SIZE - 6);

        r.block_on(log.add_record(b"x")).unwrap();
        assert_eq!(log.test_block_offset(), 8);
        let content = fs.file_content("wal").unwrap();
        assert_eq!(content.len(), BLOCK_SIZE + 8);
        assert!(content[BLOCK_SIZE - 6..BLOCK_SIZE].iter().all(|b| *b == 0));
        assert_eq!(content[BLOCK_SIZE + 6], RecordType::FullType as u8);
        assert_eq!(parse_records(&content, false), vec![first, b"x".to_vec()]);
    }

    #[test]
    fn test_recyclable_fragmentation() {
        let fs = InMemFileSystem::default();
        let mut log = new_log_writer(&fs, "wal", 0xDEADBEEFCAFEBABE, true, false);
        let r = Runtime::new().unwrap();
        let mut rng = SmallRng::seed_from_u64(3);
        let record: Vec<u8> = (0..65536).map(|_| rng.gen()).collect();
        r.block_on(log.add_record(&record)).unwrap();

        let content = fs.file_content("wal").unwrap();
        let first_payload = BLOCK_SIZE - RECYCLABLE_HEADER_SIZE;
        assert_eq!(content[6], RecordType::RecyclableFirstType as u8);
        assert_eq!(
            decode_fixed_uint16(&content[4..6]) as usize,
            first_payload
        );
        assert_eq!(content[BLOCK_SIZE + 6], RecordType::RecyclableMiddleType as u8);
        assert_eq!(content[2 * BLOCK_SIZE + 6], RecordType::RecyclableLastType as u8);
        // Low 32 bits of the log number, little endian, in every header.
        for base in [0, BLOCK_SIZE, 2 * BLOCK_SIZE] {
            assert_eq!(&content[base + 7..base + 11], &[0xBE, 0xBA, 0xFE, 0xCA]);
        }
        assert_eq!(
            decode_fixed_uint16(&content[2 * BLOCK_SIZE + 4..2 * BLOCK_SIZE + 6]) as usize,
            65536 - 2 * first_payload
        );
        assert_eq!(parse_records(&content, true), vec![record]);
    }

    #[test]
    fn test_empty_record() {
        let fs = InMemFileSystem::default();
        let mut log = new_log_writer(&fs, "wal", 7, false, false);
        let r = Runtime::new().unwrap();
        r.block_on(log.add_record(b"")).unwrap();
        let content = fs.file_content("wal").unwrap();
        assert_eq!(content.len(), HEADER_SIZE);
        assert_eq!(content[6], RecordType::FullType as u8);
        assert_eq!(decode_fixed_uint16(&content[4..6]), 0);
        assert_eq!(parse_records(&content, false), vec![vec![]]);
    }

    #[test]
    fn test_manual_flush_holds_data_back() {
        let fs = InMemFileSystem::default();
        let mut log = new_log_writer(&fs, "wal", 0, false, true);
        let r = Runtime::new().unwrap();
        r.block_on(log.add_record(b"buffered")).unwrap();
        assert!(fs.file_content("wal").is_none());
        r.block_on(log.write_buffer()).unwrap();
        assert_eq!(
            parse_records(&fs.file_content("wal").unwrap(), false),
            vec![b"buffered".to_vec()]
        );
    }

    #[test]
    fn test_close_releases_writer() {
        let fs = InMemFileSystem::default();
        let mut log = new_log_writer(&fs, "wal", 0, false, false);
        let r = Runtime::new().unwrap();
        r.block_on(log.add_record(b"final")).unwrap();
        r.block_on(log.close()).unwrap();
        assert!(log.get_file_mut().is_none());
        assert_eq!(log.get_file_size(), 0);
        let err = r.block_on(log.add_record(b"nope")).unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
        r.block_on(log.close()).unwrap();
        assert_eq!(
            parse_records(&fs.file_content("wal").unwrap(), false),
            vec![b"final".to_vec()]
        );
    }

    #[test]
    fn test_framing_roundtrip_random_records() {
        for recyclable in [false, true] {
            let fs = InMemFileSystem::default();
            let mut log = new_log_writer(&fs, "wal", 0x1234_5678_9abc_def0, recyclable, false);
            let r = Runtime::new().unwrap();
            let mut rng = SmallRng::seed_from_u64(0xf4a9);
            let mut records: Vec<Vec<u8>> = vec![];
            for _ in 0..40 {
                let len = match rng.gen_range(0..5) {
                    0 => 0,
                    1 => rng.gen_range(1..64),
                    2 => rng.gen_range(64..4096),
                    3 => BLOCK_SIZE - RECYCLABLE_HEADER_SIZE,
                    _ => rng.gen_range(BLOCK_SIZE..3 * BLOCK_SIZE),
                };
                let record: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                r.block_on(log.add_record(&record)).unwrap();
                assert!(log.test_block_offset() <= BLOCK_SIZE);
                records.push(record);
            }
            let content = fs.file_content("wal").unwrap();
            assert_eq!(parse_records(&content, recyclable), records);
        }
    }
}
