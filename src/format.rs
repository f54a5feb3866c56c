//! Format plugin boundary: consumed through a small interface.
//! MP3/Ogg/AAC framing is out of scope; this module defines the seam and a
//! generic passthrough implementation used when `FormatType::Undefined`.

use crate::binding::FormatType;
use crate::pread::PositionalFile;

/// Result of one `read_frame` call, mirroring `format_file_read`'s
/// `-1`/`-2`/bytes-read contract.
#[derive(Debug)]
pub enum FormatReadOutcome {
    /// Bytes were placed in the caller's buffer.
    Filled(usize),
    /// Natural end of file: rewind on a fallback, terminate on a plain file.
    Eof,
    /// Unrecoverable read failure: terminate the listener.
    Fatal,
}

/// Probe result from inspecting a freshly-opened file in `open_or_find`: the
/// byte offset of the first frame past any container headers, and the
/// detected nominal bitrate if derivable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatProbe {
    pub frame_start_pos: u64,
    pub bitrate_bits_per_sec: Option<u64>,
    pub detected_type: FormatType,
}

/// The seam format plugins are consumed through. A real implementation
/// would understand MP3/Ogg/AAC framing; this crate only needs the
/// interface and a generic passthrough.
pub trait FormatPlugin: Send + Sync + std::fmt::Debug {
    fn format_type(&self) -> FormatType;
    fn content_type(&self) -> &str;

    /// Probe a newly-opened file for its frame start and nominal bitrate.
    fn probe(&self, file: &PositionalFile) -> FormatProbe;

    /// Read the next frame/chunk for `listener` starting at `offset` into
    /// `buf`, returning how the read went. Bounded to a reasonable chunk
    /// size so callers can budget loop iterations.
    fn read_frame(&self, file: &PositionalFile, offset: u64, buf: &mut Vec<u8>) -> FormatReadOutcome;

    /// Any per-client header/wrapper bytes to queue before frame data
    /// (e.g. a container header). Default: nothing.
    fn create_client_data(&self) -> Vec<u8> {
        Vec::new()
    }
}

const CHUNK_SIZE: usize = 4096;

/// The generic/"undefined" format: treats the file as an opaque byte
/// stream, used whenever no specific plugin claims the content type.
#[derive(Debug, Default)]
pub struct GenericFormat {
    content_type: String,
}

impl GenericFormat {
    pub fn new(content_type: impl Into<String>) -> Self {
        GenericFormat {
            content_type: content_type.into(),
        }
    }
}

impl FormatPlugin for GenericFormat {
    fn format_type(&self) -> FormatType {
        FormatType::Undefined
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn probe(&self, file: &PositionalFile) -> FormatProbe {
        let _ = file;
        FormatProbe {
            frame_start_pos: 0,
            bitrate_bits_per_sec: None,
            detected_type: FormatType::Undefined,
        }
    }

    fn read_frame(&self, file: &PositionalFile, offset: u64, buf: &mut Vec<u8>) -> FormatReadOutcome {
        buf.resize(CHUNK_SIZE, 0);
        match file.read_at(buf, offset) {
            Ok(0) => FormatReadOutcome::Eof,
            Ok(n) => {
                buf.truncate(n);
                FormatReadOutcome::Filled(n)
            }
            Err(_) => FormatReadOutcome::Fatal,
        }
    }
}
