//! Segment file format.
//!
//! A segment is `[16-byte file header][frames or compressed blocks][footer]`.
//! While a segment is being written it lives at `<name>.part`; `seal()`
//! flushes the footer and atomically renames it to its final name.

use crate::codec::frame::{decode_frame, decode_frame_header, encode_frame};
use crate::core::event::Event;
use crate::core::timestamp::Timestamp;
use crate::error::{Error, Result};
use crate::query::cache::{BlockCache, BlockKey};
use crate::storage::segment::SegmentStats;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `"KEVT"` big-endian.
pub const FILE_MAGIC: u32 = 0x4B45_5654;
pub const FILE_HEADER_LEN: usize = 16;
pub const FILE_VERSION: u16 = 1;

pub const FOOTER_MAGIC: u32 = 0x464F_4F54;

/// One-minute coarse index granularity.
const BUCKET_NANOS: i64 = 60_000_000_000;
/// Target amount of raw frame bytes per compressed block.
pub const BLOCK_TARGET_RAW_LEN: usize = 64 * 1024;
const ZSTD_LEVEL: i32 = 3;

/// On-disk codec: whether frames are written back to back (`Raw`, used by
/// the active segment a partition is currently appending to) or packed into
/// independently-decodable compressed blocks (`Zstd`, produced by the
/// compactor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SegmentCodec {
    Raw = 0,
    Zstd = 1,
}

impl SegmentCodec {
    fn from_u16(v: u16) -> Result<Self> {
        match v {
            0 => Ok(SegmentCodec::Raw),
            1 => Ok(SegmentCodec::Zstd),
            other => Err(Error::UnknownVersion(other)),
        }
    }

    /// File extension a segment with this codec is sealed under.
    pub fn extension(&self) -> &'static str {
        match self {
            SegmentCodec::Raw => "raw",
            SegmentCodec::Zstd => "zst",
        }
    }
}

struct FileHeader {
    codec: SegmentCodec,
    created_at_ns: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        let mut w = &mut buf[..];
        w.put_u32(FILE_MAGIC);
        w.put_u16(FILE_VERSION);
        w.put_u16(self.codec as u16);
        w.put_u64(self.created_at_ns);
        buf
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_LEN {
            return Err(Error::Truncated { offset: 0 });
        }
        let magic = buf.get_u32();
        if magic != FILE_MAGIC {
            return Err(Error::Corrupt {
                location: "segment file header".to_string(),
                reason: format!("bad magic 0x{magic:08X}"),
            });
        }
        let version = buf.get_u16();
        if version != FILE_VERSION {
            return Err(Error::UnknownVersion(version));
        }
        let codec = SegmentCodec::from_u16(buf.get_u16())?;
        let created_at_ns = buf.get_u64();
        Ok(Self { codec, created_at_ns })
    }
}

/// One `(bucketStartTs, fileOffset)` entry in the footer's coarse index.
#[derive(Debug, Clone, Copy)]
pub struct FooterIndexEntry {
    pub bucket_start_ts: i64,
    pub file_offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FooterSummary {
    pub first_ts: i64,
    pub last_ts: i64,
    pub count: u64,
    pub raw_size: u64,
    pub crc: u32,
}

pub struct Footer {
    pub index: Vec<FooterIndexEntry>,
    pub summary: FooterSummary,
}

impl Footer {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(FOOTER_MAGIC);
        buf.put_u32(self.index.len() as u32);
        for entry in &self.index {
            buf.put_u64(entry.bucket_start_ts as u64);
            buf.put_u64(entry.file_offset);
        }
        buf.put_u64(self.summary.first_ts as u64);
        buf.put_u64(self.summary.last_ts as u64);
        buf.put_u64(self.summary.count);
        buf.put_u64(self.summary.raw_size);
        buf.put_u32(self.summary.crc);
        buf
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(Error::Truncated { offset: 0 });
        }
        let magic = buf.get_u32();
        if magic != FOOTER_MAGIC {
            return Err(Error::Corrupt {
                location: "segment footer".to_string(),
                reason: format!("bad footer magic 0x{magic:08X}"),
            });
        }
        let index_len = buf.get_u32() as usize;
        let needed = index_len * 16 + 8 + 8 + 8 + 8 + 4;
        if buf.remaining() < needed {
            return Err(Error::Truncated { offset: 0 });
        }
        let mut index = Vec::with_capacity(index_len);
        for _ in 0..index_len {
            let bucket_start_ts = buf.get_u64() as i64;
            let file_offset = buf.get_u64();
            index.push(FooterIndexEntry { bucket_start_ts, file_offset });
        }
        let summary = FooterSummary {
            first_ts: buf.get_u64() as i64,
            last_ts: buf.get_u64() as i64,
            count: buf.get_u64(),
            raw_size: buf.get_u64(),
            crc: buf.get_u32(),
        };
        Ok(Self { index, summary })
    }
}

fn minute_bucket(ts: Timestamp) -> i64 {
    ts.as_nanos().div_euclid(BUCKET_NANOS) * BUCKET_NANOS
}

/// Writer side of the segment format. Appends frames to a `.part` file and, on
/// `seal()`, writes the footer and renames it to its final name.
pub struct SegmentWriter {
    file: File,
    part_path: PathBuf,
    dir: PathBuf,
    codec: SegmentCodec,
    offset: u64,
    first_ts: Option<Timestamp>,
    last_ts: Option<Timestamp>,
    count: u64,
    raw_size: u64,
    index: Vec<FooterIndexEntry>,
    last_indexed_bucket: Option<i64>,
    pending_block: BytesMut,
    pending_buckets: Vec<i64>,
}

impl SegmentWriter {
    /// Create a new `.part` segment file under `dir` with the given codec.
    /// `dir` must already exist (the caller, `HourPartition`, owns directory
    /// creation so it can enforce the at-most-one-`.part` invariant).
    pub fn create(dir: impl AsRef<Path>, codec: SegmentCodec, created_at: Timestamp) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let part_path = dir.join(format!("seg-{}.part", created_at.as_nanos()));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&part_path)?;

        let header = FileHeader {
            codec,
            created_at_ns: created_at.as_nanos() as u64,
        };
        file.write_all(&header.encode())?;

        Ok(Self {
            file,
            part_path,
            dir,
            codec,
            offset: FILE_HEADER_LEN as u64,
            first_ts: None,
            last_ts: None,
            count: 0,
            raw_size: 0,
            index: Vec::new(),
            last_indexed_bucket: None,
            pending_block: BytesMut::new(),
            pending_buckets: Vec::new(),
        })
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    /// Timestamp of the first frame appended so far, if any. Used by the
    /// partition to decide whether the still-active segment can satisfy a
    /// read before it is sealed.
    pub fn first_ts(&self) -> Option<Timestamp> {
        self.first_ts
    }

    pub fn last_ts(&self) -> Option<Timestamp> {
        self.last_ts
    }

    /// Raw (pre-compression) bytes appended so far. Used by the partition
    /// to decide when to rotate.
    pub fn raw_size(&self) -> u64 {
        self.raw_size
    }

    /// Append one event's frame. Returns the logical offset of the frame in
    /// the raw (pre-compression) frame stream; callers use it only for
    /// diagnostics, since a compressed segment has no single file offset
    /// per frame.
    ///
    /// The caller is responsible for monotonic
    /// timestamp ordering; this method trusts the timestamp it's given.
    pub fn append(&mut self, event: &Event) -> Result<u64> {
        let frame = encode_frame(event);
        let logical_offset = self.raw_size;
        let bucket = minute_bucket(event.timestamp);

        match self.codec {
            SegmentCodec::Raw => {
                if self.last_indexed_bucket != Some(bucket) {
                    self.index.push(FooterIndexEntry {
                        bucket_start_ts: bucket,
                        file_offset: self.offset,
                    });
                    self.last_indexed_bucket = Some(bucket);
                }
                self.file.write_all(&frame)?;
                self.offset += frame.len() as u64;
            }
            SegmentCodec::Zstd => {
                if self.last_indexed_bucket != Some(bucket) {
                    self.pending_buckets.push(bucket);
                    self.last_indexed_bucket = Some(bucket);
                }
                self.pending_block.put_slice(&frame);
                if self.pending_block.len() >= BLOCK_TARGET_RAW_LEN {
                    self.flush_block()?;
                }
            }
        }

        self.raw_size += frame.len() as u64;
        self.count += 1;
        self.first_ts.get_or_insert(event.timestamp);
        self.last_ts = Some(event.timestamp);

        Ok(logical_offset)
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.pending_block.is_empty() {
            return Ok(());
        }
        let raw_len = self.pending_block.len() as u32;
        let compressed = zstd::bulk::compress(&self.pending_block, ZSTD_LEVEL)
            .map_err(|e| Error::Storage(format!("zstd block compression failed: {e}")))?;

        let block_offset = self.offset;
        self.file.write_all(&(compressed.len() as u32).to_be_bytes())?;
        self.file.write_all(&raw_len.to_be_bytes())?;
        self.file.write_all(&compressed)?;
        self.offset += 8 + compressed.len() as u64;

        for bucket in self.pending_buckets.drain(..) {
            self.index.push(FooterIndexEntry {
                bucket_start_ts: bucket,
                file_offset: block_offset,
            });
        }
        self.pending_block.clear();
        Ok(())
    }

    /// Flush buffered data and fsync, without sealing. Used by the writer's
    /// fsync-cadence policy to commit between appends.
    pub fn sync(&mut self) -> Result<()> {
        if let SegmentCodec::Zstd = self.codec {
            if self.pending_block.len() >= BLOCK_TARGET_RAW_LEN {
                self.flush_block()?;
            }
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Flush, write the footer, and atomically rename from `.part` to the
    /// final `seg-<firstTs>-<lastTs>-<rand>.<codec>` name. Returns the
    /// final path and stats.
    pub fn seal(mut self) -> Result<(PathBuf, SegmentStats)> {
        if let SegmentCodec::Zstd = self.codec {
            self.flush_block()?;
        }

        self.index.sort_by_key(|e| e.bucket_start_ts);
        let first_ts = self.first_ts.unwrap_or(Timestamp::from_nanos(0));
        let last_ts = self.last_ts.unwrap_or(first_ts);

        let mut crc_input = BytesMut::new();
        crc_input.put_u64(self.count);
        crc_input.put_u64(self.raw_size);
        let crc = crc32c::crc32c(&crc_input);

        let footer = Footer {
            index: self.index.clone(),
            summary: FooterSummary {
                first_ts: first_ts.as_nanos(),
                last_ts: last_ts.as_nanos(),
                count: self.count,
                raw_size: self.raw_size,
                crc,
            },
        };
        let footer_bytes = footer.encode();
        let footer_start = self.offset;
        self.file.write_all(&footer_bytes)?;
        self.file.write_all(&footer_start.to_be_bytes())?;
        self.file.sync_all()?;

        let rand = std::process::id() as u64 ^ (footer_start.wrapping_mul(2654435761));
        let final_name = format!(
            "seg-{}-{}-{rand:08x}.{}",
            first_ts.as_nanos(),
            last_ts.as_nanos(),
            self.codec.extension()
        );
        let final_path = self.dir.join(final_name);
        std::fs::rename(&self.part_path, &final_path)?;

        let stats = SegmentStats {
            first_ts,
            last_ts,
            count: self.count,
            raw_size: self.raw_size,
            file_size: footer_start + footer_bytes.len() as u64 + 8,
            codec: self.codec,
            quarantined: false,
        };
        Ok((final_path, stats))
    }
}

/// Reader side of the segment format. Opens a sealed segment, its footer, and
/// supports header-prefiltered scans.
pub struct SegmentReader {
    file: File,
    path: PathBuf,
    codec: SegmentCodec,
    footer: Footer,
    footer_start: u64,
    quarantined: bool,
    cache: Option<Arc<BlockCache>>,
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_cache(path, None)
    }

    /// Open a segment that shares a decoded-block cache with the rest of the
    /// query path. Compressed (`Zstd`) segments look up each block by
    /// `(path, block_offset)` before decompressing it; `Raw` segments have
    /// no blocks to cache and ignore it.
    pub fn open_cached(path: impl AsRef<Path>, cache: Arc<BlockCache>) -> Result<Self> {
        Self::open_with_cache(path, Some(cache))
    }

    fn open_with_cache(path: impl AsRef<Path>, cache: Option<Arc<BlockCache>>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        let mut header_buf = [0u8; FILE_HEADER_LEN];
        file.read_exact(&mut header_buf)?;
        let header = FileHeader::decode(&header_buf)?;

        let (footer, footer_start, quarantined) = match Self::read_footer(&mut file, file_len) {
            Ok((footer, footer_start)) => (footer, footer_start, false),
            Err(_) => (
                Footer {
                    index: Vec::new(),
                    summary: FooterSummary {
                        first_ts: 0,
                        last_ts: 0,
                        count: 0,
                        raw_size: 0,
                        crc: 0,
                    },
                },
                file_len,
                true,
            ),
        };

        Ok(Self {
            file,
            path,
            codec: header.codec,
            footer,
            footer_start,
            quarantined,
            cache,
        })
    }

    fn read_footer(file: &mut File, file_len: u64) -> Result<(Footer, u64)> {
        if file_len < FILE_HEADER_LEN as u64 + 8 {
            return Err(Error::Truncated { offset: file_len });
        }
        file.seek(SeekFrom::End(-8))?;
        let mut offset_buf = [0u8; 8];
        file.read_exact(&mut offset_buf)?;
        let footer_start = u64::from_be_bytes(offset_buf);
        if footer_start >= file_len - 8 {
            return Err(Error::Corrupt {
                location: "segment footer".to_string(),
                reason: "footer offset out of range".to_string(),
            });
        }

        let footer_len = (file_len - 8 - footer_start) as usize;
        let mut footer_buf = vec![0u8; footer_len];
        file.seek(SeekFrom::Start(footer_start))?;
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::decode(&footer_buf)?;
        Ok((footer, footer_start))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn codec(&self) -> SegmentCodec {
        self.codec
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined
    }

    pub fn stat(&self) -> SegmentStats {
        let file_size = self.file.metadata().map(|m| m.len()).unwrap_or(0);
        SegmentStats {
            first_ts: Timestamp::from_nanos(self.footer.summary.first_ts),
            last_ts: Timestamp::from_nanos(self.footer.summary.last_ts),
            count: self.footer.summary.count,
            raw_size: self.footer.summary.raw_size,
            file_size,
            codec: self.codec,
            quarantined: self.quarantined,
        }
    }

    /// The file offset to begin scanning from in order to find the first
    /// frame at or after `from_ts`, using the coarse per-minute index.
    fn scan_start_offset(&self, from_ts: Timestamp) -> u64 {
        let target_bucket = minute_bucket(from_ts);
        let mut start = FILE_HEADER_LEN as u64;
        for entry in &self.footer.index {
            if entry.bucket_start_ts <= target_bucket {
                start = entry.file_offset;
            } else {
                break;
            }
        }
        start
    }

    /// Read all raw frame bytes from `from_offset` to the footer, fully
    /// decompressing any blocks encountered along the way. On a quarantined
    /// segment the footer offset is unreliable, so this reads as much as it
    /// can and stops at the first I/O or decompression error rather than
    /// failing the whole scan — callers see whatever frames preceded the
    /// damage.
    fn read_frame_stream(&mut self, from_offset: u64) -> Result<Vec<u8>> {
        let file_len = self.file.metadata()?.len();
        let footer_start = self.footer_start.min(file_len);
        let mut out = Vec::new();
        let mut offset = from_offset;

        match self.codec {
            SegmentCodec::Raw => {
                if offset >= footer_start {
                    return Ok(out);
                }
                let len = (footer_start - offset) as usize;
                let mut buf = vec![0u8; len];
                self.file.seek(SeekFrom::Start(offset))?;
                match self.file.read_exact(&mut buf) {
                    Ok(()) => out = buf,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        self.file.seek(SeekFrom::Start(offset))?;
                        self.file.read_to_end(&mut out)?;
                    }
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            SegmentCodec::Zstd => {
                while offset < footer_start {
                    self.file.seek(SeekFrom::Start(offset))?;
                    let mut len_buf = [0u8; 8];
                    if self.file.read_exact(&mut len_buf).is_err() {
                        break;
                    }
                    let block_len = u32::from_be_bytes(len_buf[0..4].try_into().unwrap()) as usize;
                    let raw_len = u32::from_be_bytes(len_buf[4..8].try_into().unwrap()) as usize;
                    let mut compressed = vec![0u8; block_len];
                    if self.file.read_exact(&mut compressed).is_err() {
                        break;
                    }

                    let decode = || {
                        zstd::bulk::decompress(&compressed, raw_len.max(BLOCK_TARGET_RAW_LEN * 4))
                            .map(Bytes::from)
                            .map_err(|_| ())
                    };
                    let decompressed: Bytes = match &self.cache {
                        Some(cache) => {
                            let key = BlockKey { segment: self.path.clone(), block_offset: offset };
                            match cache.get_or_insert(key, decode) {
                                Ok(d) => d,
                                Err(()) => break,
                            }
                        }
                        None => match decode() {
                            Ok(d) => d,
                            Err(()) => break,
                        },
                    };
                    out.extend_from_slice(&decompressed);
                    offset += 8 + block_len as u64;
                }
            }
        }
        Ok(out)
    }

    /// Decode every frame whose timestamp falls in `[from_ts, to_ts]`,
    /// calling `visitor` in file order. Frames outside the range are
    /// skipped using the header-only decode where possible.
    pub fn scan(
        &mut self,
        from_ts: Timestamp,
        to_ts: Timestamp,
        mut visitor: impl FnMut(Event),
    ) -> Result<()> {
        let start = self.scan_start_offset(from_ts);
        let stream = self.read_frame_stream(start)?;

        let mut pos = 0usize;
        while pos < stream.len() {
            let remaining = &stream[pos..];
            let header = match decode_frame_header(remaining) {
                Ok(h) => h,
                Err(_) => break,
            };
            if header.timestamp > to_ts {
                break;
            }
            if header.timestamp < from_ts {
                pos += header.frame_len();
                continue;
            }
            match decode_frame(remaining) {
                Ok((event, consumed)) => {
                    visitor(event);
                    pos += consumed;
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Decode every frame in the segment without a timestamp filter.
    pub fn scan_all(&mut self, mut visitor: impl FnMut(Event)) -> Result<()> {
        self.scan(Timestamp::MIN, Timestamp::MAX, |e| visitor(e))
    }
}

/// Scans `file` (positioned anywhere; seeks internally) from its frame data
/// forward, stopping at the first corrupt or truncated frame/block. Used by
/// recovery to find the longest valid prefix of a
/// segment whose footer is missing or unreliable.
///
/// Returns the byte length of the valid prefix (header-relative, i.e.
/// including the file header) plus the footer index/summary that prefix
/// would need.
fn scan_for_recovery(file: &mut File, codec: SegmentCodec) -> Result<(u64, Vec<FooterIndexEntry>, FooterSummary)> {
    let mut index = Vec::new();
    let mut last_indexed_bucket: Option<i64> = None;
    let mut first_ts: Option<i64> = None;
    let mut last_ts: i64 = 0;
    let mut count: u64 = 0;
    let mut raw_size: u64 = 0;

    let mut valid_len = FILE_HEADER_LEN as u64;

    match codec {
        SegmentCodec::Raw => {
            file.seek(SeekFrom::Start(FILE_HEADER_LEN as u64))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            let mut pos = 0usize;
            while pos < buf.len() {
                let remaining = &buf[pos..];
                let header = match decode_frame_header(remaining) {
                    Ok(h) => h,
                    Err(_) => break,
                };
                if remaining.len() < header.frame_len() {
                    break;
                }
                if decode_frame(remaining).is_err() {
                    break;
                }
                let bucket = minute_bucket(header.timestamp);
                if last_indexed_bucket != Some(bucket) {
                    index.push(FooterIndexEntry {
                        bucket_start_ts: bucket,
                        file_offset: FILE_HEADER_LEN as u64 + pos as u64,
                    });
                    last_indexed_bucket = Some(bucket);
                }
                first_ts.get_or_insert(header.timestamp.as_nanos());
                last_ts = header.timestamp.as_nanos();
                count += 1;
                raw_size += header.frame_len() as u64;
                pos += header.frame_len();
            }
            valid_len = FILE_HEADER_LEN as u64 + pos as u64;
        }
        SegmentCodec::Zstd => {
            let mut offset = FILE_HEADER_LEN as u64;
            loop {
                file.seek(SeekFrom::Start(offset))?;
                let mut len_buf = [0u8; 8];
                if file.read_exact(&mut len_buf).is_err() {
                    break;
                }
                let block_len = u32::from_be_bytes(len_buf[0..4].try_into().unwrap()) as usize;
                let raw_len = u32::from_be_bytes(len_buf[4..8].try_into().unwrap()) as usize;
                let mut compressed = vec![0u8; block_len];
                if file.read_exact(&mut compressed).is_err() {
                    break;
                }
                let decompressed = match zstd::bulk::decompress(&compressed, raw_len.max(BLOCK_TARGET_RAW_LEN * 4)) {
                    Ok(d) => d,
                    Err(_) => break,
                };

                let mut pos = 0usize;
                let mut block_buckets = Vec::new();
                let mut block_ok = true;
                while pos < decompressed.len() {
                    let remaining = &decompressed[pos..];
                    let header = match decode_frame_header(remaining) {
                        Ok(h) => h,
                        Err(_) => {
                            block_ok = false;
                            break;
                        }
                    };
                    if decode_frame(remaining).is_err() {
                        block_ok = false;
                        break;
                    }
                    let bucket = minute_bucket(header.timestamp);
                    if !block_buckets.contains(&bucket) {
                        block_buckets.push(bucket);
                    }
                    first_ts.get_or_insert(header.timestamp.as_nanos());
                    last_ts = header.timestamp.as_nanos();
                    count += 1;
                    raw_size += header.frame_len() as u64;
                    pos += header.frame_len();
                }
                if !block_ok {
                    break;
                }
                for bucket in block_buckets {
                    if last_indexed_bucket != Some(bucket) {
                        index.push(FooterIndexEntry { bucket_start_ts: bucket, file_offset: offset });
                        last_indexed_bucket = Some(bucket);
                    }
                }
                offset += 8 + block_len as u64;
                valid_len = offset;
            }
        }
    }

    let summary = FooterSummary {
        first_ts: first_ts.unwrap_or(0),
        last_ts,
        count,
        raw_size,
        crc: 0,
    };
    Ok((valid_len, index, summary))
}

/// Truncate `path` to its longest valid prefix and write a fresh footer
/// over it. Does not rename the
/// file; the caller decides the final name.
pub fn repair_in_place(path: &Path) -> Result<SegmentStats> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut header_buf = [0u8; FILE_HEADER_LEN];
    file.read_exact(&mut header_buf)?;
    let header = FileHeader::decode(&header_buf)?;

    let (valid_len, mut index, summary) = scan_for_recovery(&mut file, header.codec)?;
    index.sort_by_key(|e| e.bucket_start_ts);

    let footer = Footer { index, summary };
    let footer_bytes = footer.encode();

    file.set_len(valid_len)?;
    file.seek(SeekFrom::Start(valid_len))?;
    file.write_all(&footer_bytes)?;
    file.write_all(&valid_len.to_be_bytes())?;
    file.sync_all()?;

    Ok(SegmentStats {
        first_ts: Timestamp::from_nanos(summary.first_ts),
        last_ts: Timestamp::from_nanos(summary.last_ts),
        count: summary.count,
        raw_size: summary.raw_size,
        file_size: valid_len + footer_bytes.len() as u64 + 8,
        codec: header.codec,
        quarantined: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{EventKind, ResourceRef};
    use bytes::Bytes;
    use tempfile::TempDir;

    fn sample(ts: i64, i: u64) -> Event {
        let resource = ResourceRef::new("", "v1", "Pod", "default", format!("p{i}"), format!("u{i}"));
        Event::new(Timestamp::from_nanos(ts), EventKind::Create, resource, Bytes::from_static(b"{}"))
    }

    #[test]
    fn raw_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), SegmentCodec::Raw, Timestamp::from_nanos(1)).unwrap();
        for i in 0..10 {
            writer.append(&sample(1_000_000_000 + i as i64, i)).unwrap();
        }
        let (path, stats) = writer.seal().unwrap();
        assert_eq!(stats.count, 10);
        assert!(path.exists());
        assert!(!path.to_string_lossy().ends_with(".part"));

        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(!reader.is_quarantined());
        let mut seen = Vec::new();
        reader.scan_all(|e| seen.push(e.timestamp.as_nanos())).unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn compressed_round_trip_across_multiple_blocks() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), SegmentCodec::Zstd, Timestamp::from_nanos(1)).unwrap();
        for i in 0..5000u64 {
            writer.append(&sample(1_000_000_000 + i as i64 * 1_000_000, i)).unwrap();
        }
        let (path, stats) = writer.seal().unwrap();
        assert_eq!(stats.count, 5000);
        assert_eq!(stats.codec, SegmentCodec::Zstd);

        let mut reader = SegmentReader::open(&path).unwrap();
        let mut count = 0u64;
        reader.scan_all(|_| count += 1).unwrap();
        assert_eq!(count, 5000);
    }

    #[test]
    fn time_range_scan_skips_frames_outside_window() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), SegmentCodec::Raw, Timestamp::from_nanos(1)).unwrap();
        for minute in 0..5 {
            let ts = minute as i64 * BUCKET_NANOS + 1_700_000_000_000_000_000;
            writer.append(&sample(ts, minute)).unwrap();
        }
        let (path, _) = writer.seal().unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        let from = Timestamp::from_nanos(2 * BUCKET_NANOS + 1_700_000_000_000_000_000);
        let to = Timestamp::from_nanos(3 * BUCKET_NANOS + 1_700_000_000_000_000_000);
        let mut seen = Vec::new();
        reader.scan(from, to, |e| seen.push(e.timestamp)).unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn footer_index_has_one_entry_per_minute_bucket() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), SegmentCodec::Raw, Timestamp::from_nanos(1)).unwrap();
        let base = 1_700_000_000_000_000_000i64;
        for minute in 0..3 {
            writer.append(&sample(base + minute as i64 * BUCKET_NANOS, minute)).unwrap();
        }
        let (path, _) = writer.seal().unwrap();
        let reader = SegmentReader::open(&path).unwrap();
        assert_eq!(reader.footer.index.len(), 3);
        assert!(reader.footer.index.windows(2).all(|w| w[0].bucket_start_ts < w[1].bucket_start_ts));
    }

    #[test]
    fn cached_reader_decodes_compressed_blocks_through_the_cache() {
        use crate::query::cache::BlockCache;

        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), SegmentCodec::Zstd, Timestamp::from_nanos(1)).unwrap();
        for i in 0..5000u64 {
            writer.append(&sample(1_000_000_000 + i as i64 * 1_000_000, i)).unwrap();
        }
        let (path, stats) = writer.seal().unwrap();

        let cache = Arc::new(BlockCache::new(16 * 1024 * 1024));
        let mut reader = SegmentReader::open_cached(&path, cache.clone()).unwrap();
        let mut count = 0u64;
        reader.scan_all(|_| count += 1).unwrap();
        assert_eq!(count, stats.count);
        assert!(!cache.is_empty());

        // A second reader sharing the same cache sees identical results.
        let mut reader2 = SegmentReader::open_cached(&path, cache).unwrap();
        let mut count2 = 0u64;
        reader2.scan_all(|_| count2 += 1).unwrap();
        assert_eq!(count2, stats.count);
    }

    #[test]
    fn truncated_segment_is_quarantined_on_open() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), SegmentCodec::Raw, Timestamp::from_nanos(1)).unwrap();
        writer.append(&sample(1, 0)).unwrap();
        let (path, _) = writer.seal().unwrap();

        let file_len = std::fs::metadata(&path).unwrap().len();
        let truncated = std::fs::read(&path).unwrap();
        std::fs::write(&path, &truncated[..(file_len as usize - 4)]).unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        assert!(reader.is_quarantined());
    }
}
