//! Small shared helpers: byte-unit formatting, the zero payload chunk used
//! by the measurement endpoints, and HTTP `Range` parsing.

use bytes::Bytes;

/// One mebibyte, the unit of measurement payloads.
pub const MB: usize = 1024 * 1024;

/// A static all-zero chunk of exactly one MiB.
static MB_CHUNK: [u8; MB] = [0u8; MB];

/// Borrow the shared zero chunk.
pub fn zero_chunk() -> Bytes {
    Bytes::from_static(&MB_CHUNK)
}

const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

/// Format a byte count with a binary unit suffix for log lines.
pub fn bytes_to_unit(mut size: f64) -> String {
    let mut unit = 0;
    while size >= 1000.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", size as i64, UNITS[unit])
    } else {
        format!("{:.2}{}", size, UNITS[unit])
    }
}

/// Stream `len` bytes from an already-positioned async file in 64 KiB
/// chunks.
pub fn file_stream(
    file: tokio::fs::File,
    len: i64,
) -> impl futures::Stream<Item = std::io::Result<Bytes>> + Send {
    use tokio::io::AsyncReadExt;
    futures::stream::unfold((file, len), |(mut file, remaining)| async move {
        if remaining <= 0 {
            return None;
        }
        let cap = remaining.min(64 * 1024) as usize;
        let mut buf = vec![0u8; cap];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), (file, remaining - n as i64)))
            }
            Err(e) => Some((Err(e), (file, 0))),
        }
    })
}

/// An all-zero byte stream of exactly `total` bytes in MiB chunks.
pub fn zero_stream(
    total: i64,
) -> impl futures::Stream<Item = std::result::Result<Bytes, std::convert::Infallible>> + Send {
    futures::stream::unfold(total, |remaining| async move {
        if remaining <= 0 {
            return None;
        }
        let n = remaining.min(MB as i64) as usize;
        Some((Ok(zero_chunk().slice(..n)), remaining - n as i64))
    })
}

/// Adapt a byte stream into an [`AsyncRead`](tokio::io::AsyncRead).
pub struct StreamReader<S> {
    stream: S,
    leftover: Bytes,
}

impl<S> StreamReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            leftover: Bytes::new(),
        }
    }
}

impl<S, E> tokio::io::AsyncRead for StreamReader<S>
where
    S: futures::Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use futures::StreamExt;
        let this = self.get_mut();
        if this.leftover.is_empty() {
            match this.stream.poll_next_unpin(cx) {
                std::task::Poll::Pending => return std::task::Poll::Pending,
                std::task::Poll::Ready(None) => return std::task::Poll::Ready(Ok(())),
                std::task::Poll::Ready(Some(Err(e))) => {
                    return std::task::Poll::Ready(Err(std::io::Error::other(e)))
                }
                std::task::Poll::Ready(Some(Ok(chunk))) => this.leftover = chunk,
            }
        }
        let n = this.leftover.len().min(buf.remaining());
        buf.put_slice(&this.leftover.split_to(n));
        std::task::Poll::Ready(Ok(()))
    }
}

/// Join URL path segments onto a base URL, keeping the base's own path.
///
/// `join_url("https://cdn.example/foo", "/download/x")` yields
/// `https://cdn.example/foo/download/x`.
pub fn join_url(base: &str, path: &str) -> crate::error::Result<String> {
    let mut url = url::Url::parse(base)?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
        segments.pop_if_empty();
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
    }
    Ok(url.to_string())
}

/// Parse an HTTP `Range` header against an entity of `size` bytes.
///
/// Returns `None` when the header is malformed (callers then ignore it and
/// serve the whole entity), and `Some(vec![])` when it parses but no range
/// is satisfiable. Each element is `(start, length)`.
pub fn parse_range(header: &str, size: i64) -> Option<Vec<(i64, i64)>> {
    let spec = header.strip_prefix("bytes=")?;
    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        let (start_s, end_s) = part.split_once('-')?;
        if start_s.is_empty() {
            // Suffix form: the final `end_s` bytes.
            let n: i64 = end_s.parse().ok()?;
            if n <= 0 {
                return None;
            }
            let start = (size - n).max(0);
            if size > 0 {
                ranges.push((start, size - start));
            }
        } else {
            let start: i64 = start_s.parse().ok()?;
            if start < 0 {
                return None;
            }
            if start >= size {
                // Syntactically valid but unsatisfiable.
                continue;
            }
            let end = if end_s.is_empty() {
                size - 1
            } else {
                let end: i64 = end_s.parse().ok()?;
                if end < start {
                    return None;
                }
                end.min(size - 1)
            };
            ranges.push((start, end - start + 1));
        }
    }
    Some(ranges)
}

/// Sum of ranged lengths when it is smaller than the full entity; used to
/// correct accounting for ranged redirects.
pub fn ranged_size(range_header: Option<&str>, size: i64) -> i64 {
    if let Some(header) = range_header {
        if let Some(ranges) = parse_range(header, size) {
            let total: i64 = ranges.iter().map(|(_, len)| len).sum();
            if total > 0 && total < size {
                return total;
            }
        }
    }
    size
}
