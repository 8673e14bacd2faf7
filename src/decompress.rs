//! Decompression pipeline: wraps an upstream archive byte stream in the
//! decoder matching its advertised [`Compression`], and caps the number of
//! bytes it will ever yield to the archive's advertised size.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, XzDecoder, ZstdDecoder};
use pin_project::pin_project;
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

use crate::narinfo::Compression;

#[pin_project(project = DecoderProj)]
enum Decoder<R: AsyncBufRead> {
    None(#[pin] R),
    Xz(#[pin] XzDecoder<R>),
    Bzip2(#[pin] BzDecoder<R>),
    Gzip(#[pin] GzipDecoder<R>),
    Zstd(#[pin] ZstdDecoder<R>),
}

impl<R: AsyncBufRead> AsyncRead for Decoder<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.project() {
            DecoderProj::None(r) => r.poll_read(cx, buf),
            DecoderProj::Xz(r) => r.poll_read(cx, buf),
            DecoderProj::Bzip2(r) => r.poll_read(cx, buf),
            DecoderProj::Gzip(r) => r.poll_read(cx, buf),
            DecoderProj::Zstd(r) => r.poll_read(cx, buf),
        }
    }
}

/// A decompressing, size-bounded reader.
///
/// Reading stops with an error as soon as more than `max_bytes` bytes would
/// have been produced, so a hostile or broken upstream cannot exhaust local
/// disk via a runaway decompressor.
#[pin_project]
pub struct DecompressingReader<R: AsyncBufRead> {
    #[pin]
    inner: Decoder<R>,
    max_bytes: u64,
    produced: u64,
}

impl<R: AsyncBufRead> DecompressingReader<R> {
    /// Wraps `reader`, decompressing according to `compression` and
    /// refusing to yield more than `max_bytes` total bytes.
    pub fn new(reader: R, compression: Compression, max_bytes: u64) -> anyhow::Result<Self> {
        let inner = match compression {
            Compression::None => Decoder::None(reader),
            Compression::Xz => Decoder::Xz(XzDecoder::new(reader)),
            Compression::Bzip2 => Decoder::Bzip2(BzDecoder::new(reader)),
            Compression::Gzip => Decoder::Gzip(GzipDecoder::new(reader)),
            Compression::Zstd => Decoder::Zstd(ZstdDecoder::new(reader)),
        };
        Ok(DecompressingReader {
            inner,
            max_bytes,
            produced: 0,
        })
    }
}

impl<R: AsyncBufRead> AsyncRead for DecompressingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let poll = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let produced_now = (buf.filled().len() - before) as u64;
            *this.produced += produced_now;
            if *this.produced > *this.max_bytes {
                return Poll::Ready(Err(std::io::Error::other(format!(
                    "decompressed archive exceeded advertised size of {} bytes",
                    this.max_bytes
                ))));
            }
        }
        poll
    }
}
