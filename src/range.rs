use crate::error::DownloadError;

/// Inclusive byte interval `[start, end]` of a file `total` bytes long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ByteRange {
    /// The whole file. Only meaningful for `total > 0`.
    pub fn full(total: u64) -> Self {
        Self {
            start: 0,
            end: total.saturating_sub(1),
            total,
        }
    }

    /// Number of bytes covered.  Zero for an empty file or an inverted range.
    pub fn len(&self) -> u64 {
        if self.total == 0 || self.start > self.end {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject intervals that cannot be served from the file.
    /// [`resolve`] does not do this on its own.
    pub fn check_satisfiable(&self) -> Result<(), DownloadError> {
        if self.start > self.end || self.end >= self.total {
            return Err(DownloadError::MalformedRange(format!(
                "bytes {}-{} outside 0-{}",
                self.start,
                self.end,
                self.total.saturating_sub(1)
            )));
        }
        Ok(())
    }

    /// `Content-Range` header value.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Resolve an optional `Range` header value against the file length.
///
/// Only the single-range form `bytes=<start>-[<end>]` is understood; an empty
/// or missing end means "to the last byte". Bounds are taken as given.
pub fn resolve(header: Option<&str>, total: u64) -> Result<ByteRange, DownloadError> {
    let Some(value) = header else {
        return Ok(ByteRange::full(total));
    };
    let malformed = || DownloadError::MalformedRange(value.to_string());

    let spec = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(malformed)?;
    if spec.contains(',') {
        return Err(malformed());
    }
    let (left, right) = spec.split_once('-').ok_or_else(malformed)?;

    let start: u64 = left.trim().parse().map_err(|_| malformed())?;
    let right = right.trim();
    let end = if right.is_empty() {
        total.saturating_sub(1)
    } else {
        right.parse().map_err(|_| malformed())?
    };

    Ok(ByteRange { start, end, total })
}
