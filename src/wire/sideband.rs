//! Sideband multiplexing inside a pkt-line stream.
//!
//! When a sideband capability is active, each data frame's first payload
//! byte selects a channel: 1 carries pack data, 2 carries progress text,
//! 3 carries a fatal error message that aborts the session. The demuxer
//! exposes channel 1 as a [`std::io::Read`] so a pack parser can consume
//! it directly; progress text is forwarded to the monitor.

use std::io::{self, Read, Write};

use crate::monitor::ProgressMonitor;

use super::pktline::{Frame, PktReader, PktWriter, WireError, MAX_PAYLOAD};

/// Pack data channel.
pub const CH_DATA: u8 = 1;
/// Progress channel.
pub const CH_PROGRESS: u8 = 2;
/// Fatal error channel.
pub const CH_ERROR: u8 = 3;

/// Demuxes sideband frames, yielding the data channel as a byte stream.
///
/// A channel-3 frame surfaces as an [`io::Error`] with kind `Other`
/// carrying the peer's message; the caller maps it to its protocol error.
pub struct SidebandReader<'a, R: Read, M: ProgressMonitor> {
    pkt: &'a mut PktReader<R>,
    monitor: &'a mut M,
    buffer: Vec<u8>,
    buffer_pos: usize,
    done: bool,
}

impl<'a, R: Read, M: ProgressMonitor> SidebandReader<'a, R, M> {
    /// Wraps a pkt-line reader mid-stream.
    pub fn new(pkt: &'a mut PktReader<R>, monitor: &'a mut M) -> Self {
        Self {
            pkt,
            monitor,
            buffer: Vec::new(),
            buffer_pos: 0,
            done: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        loop {
            if self.done || self.buffer_pos < self.buffer.len() {
                return Ok(());
            }
            let frame = self
                .pkt
                .read()
                .map_err(|err| io::Error::other(err.to_string()))?;
            match frame {
                None | Some(Frame::Flush) => {
                    self.done = true;
                    return Ok(());
                }
                Some(Frame::Delim | Frame::ResponseEnd) => {
                    return Err(io::Error::other("unexpected delimiter in sideband"));
                }
                Some(Frame::Data(payload)) => {
                    let Some((&channel, rest)) = payload.split_first() else {
                        continue; // empty data frame carries nothing
                    };
                    match channel {
                        CH_DATA => {
                            self.buffer = rest.to_vec();
                            self.buffer_pos = 0;
                        }
                        CH_PROGRESS => {
                            let text = String::from_utf8_lossy(rest);
                            self.monitor.text(text.trim_end());
                        }
                        CH_ERROR => {
                            let text = String::from_utf8_lossy(rest).trim_end().to_owned();
                            return Err(io::Error::other(format!("remote error: {text}")));
                        }
                        other => {
                            return Err(io::Error::other(format!(
                                "unknown sideband channel {other}"
                            )));
                        }
                    }
                }
            }
        }
    }
}

impl<R: Read, M: ProgressMonitor> Read for SidebandReader<'_, R, M> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.monitor.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        self.fill()?;
        if self.done && self.buffer_pos >= self.buffer.len() {
            return Ok(0);
        }
        let available = &self.buffer[self.buffer_pos..];
        let take = available.len().min(out.len());
        out[..take].copy_from_slice(&available[..take]);
        self.buffer_pos += take;
        Ok(take)
    }
}

/// Muxes a server's pack output and progress text onto sideband channels.
pub struct SidebandWriter<'a, W: Write> {
    pkt: &'a mut PktWriter<W>,
    /// Largest payload per frame (999 bytes under `side-band`, the full
    /// pkt-line maximum under `side-band-64k`).
    frame_limit: usize,
}

impl<'a, W: Write> SidebandWriter<'a, W> {
    /// Writer using `side-band-64k` frame sizes.
    pub fn new_64k(pkt: &'a mut PktWriter<W>) -> Self {
        Self {
            pkt,
            frame_limit: MAX_PAYLOAD - 1,
        }
    }

    /// Writer using small (1000-byte) `side-band` frames.
    pub fn new_small(pkt: &'a mut PktWriter<W>) -> Self {
        Self {
            pkt,
            frame_limit: 999,
        }
    }

    fn send(&mut self, channel: u8, mut payload: &[u8]) -> Result<(), WireError> {
        while !payload.is_empty() {
            let take = payload.len().min(self.frame_limit);
            let mut frame = Vec::with_capacity(take + 1);
            frame.push(channel);
            frame.extend_from_slice(&payload[..take]);
            self.pkt.write_data(&frame)?;
            payload = &payload[take..];
        }
        Ok(())
    }

    /// Sends pack bytes on channel 1.
    pub fn write_pack(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.send(CH_DATA, bytes)
    }

    /// Sends progress text on channel 2.
    pub fn write_progress(&mut self, text: &str) -> Result<(), WireError> {
        self.send(CH_PROGRESS, text.as_bytes())
    }

    /// Sends a fatal message on channel 3.
    pub fn write_fatal(&mut self, text: &str) -> Result<(), WireError> {
        self.send(CH_ERROR, text.as_bytes())
    }
}

/// [`Write`] adapter over channel 1, used to stream a pack through the mux.
pub struct SidebandPackSink<'a, 'b, W: Write> {
    writer: &'a mut SidebandWriter<'b, W>,
}

impl<'a, 'b, W: Write> SidebandPackSink<'a, 'b, W> {
    /// Sink over `writer`'s data channel.
    pub fn new(writer: &'a mut SidebandWriter<'b, W>) -> Self {
        Self { writer }
    }
}

impl<W: Write> Write for SidebandPackSink<'_, '_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer
            .write_pack(buf)
            .map_err(|err| io::Error::other(err.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::NullMonitor;
    use std::io::Cursor;

    fn mux(build: impl FnOnce(&mut SidebandWriter<'_, Vec<u8>>)) -> Vec<u8> {
        let mut pkt = PktWriter::new(Vec::new());
        {
            let mut writer = SidebandWriter::new_64k(&mut pkt);
            build(&mut writer);
        }
        pkt.flush_pkt().unwrap();
        pkt.into_inner()
    }

    #[test]
    fn data_channel_reassembles() {
        let bytes = mux(|writer| {
            writer.write_pack(b"PACK....").unwrap();
            writer.write_progress("counting").unwrap();
            writer.write_pack(b"more").unwrap();
        });

        let mut pkt = PktReader::new(Cursor::new(bytes));
        let mut monitor = NullMonitor;
        let mut reader = SidebandReader::new(&mut pkt, &mut monitor);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"PACK....more");
    }

    #[test]
    fn error_channel_aborts() {
        let bytes = mux(|writer| {
            writer.write_pack(b"partial").unwrap();
            writer.write_fatal("out of disk").unwrap();
        });

        let mut pkt = PktReader::new(Cursor::new(bytes));
        let mut monitor = NullMonitor;
        let mut reader = SidebandReader::new(&mut pkt, &mut monitor);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert!(err.to_string().contains("out of disk"));
    }

    #[test]
    fn large_payload_splits_into_frames() {
        let payload = vec![0x2au8; MAX_PAYLOAD * 2];
        let bytes = mux(|writer| writer.write_pack(&payload).unwrap());

        let mut pkt = PktReader::new(Cursor::new(bytes));
        let mut monitor = NullMonitor;
        let mut reader = SidebandReader::new(&mut pkt, &mut monitor);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn small_band_frames_capped_at_1000() {
        let mut pkt = PktWriter::new(Vec::new());
        {
            let mut writer = SidebandWriter::new_small(&mut pkt);
            writer.write_pack(&vec![1u8; 5000]).unwrap();
        }
        let bytes = pkt.into_inner();
        let mut reader = PktReader::new(Cursor::new(bytes));
        while let Some(frame) = reader.read().unwrap() {
            if let Frame::Data(payload) = frame {
                assert!(payload.len() <= 1000);
            }
        }
    }
}
