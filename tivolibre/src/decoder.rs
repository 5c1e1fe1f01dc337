//! The decoder pipeline: envelope first, then the PS or TS payload.

use std::io::{Read, Write};

use log::{debug, error};

use crate::crypto::TuringPool;
use crate::envelope::{Envelope, Format};
use crate::error::{DecodeError, Result};
use crate::io::CountingReader;
use crate::ps::PsDecoder;
use crate::ts::TsDecoder;

/// Knobs for a decode run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderOptions {
    /// Reproduce the byte-exact output of TiVo's DirectShow filter,
    /// including its quirks around resynchronization. Off by default: the
    /// plain output drops resync garbage and NULL padding.
    pub compatibility_mode: bool,
}

/// Decodes one recording from a sequential input source.
pub struct TivoDecoder<R> {
    input: CountingReader<R>,
    mak: String,
    options: DecoderOptions,
}

impl<R: Read> TivoDecoder<R> {
    pub fn new(input: R, mak: impl Into<String>, options: DecoderOptions) -> Self {
        Self {
            input: CountingReader::new(input),
            mak: mak.into(),
            options,
        }
    }

    /// Decode the whole recording to `output`, returning the decrypted
    /// metadata chunk payloads.
    pub fn decode<W: Write>(mut self, output: &mut W) -> Result<Vec<Vec<u8>>> {
        let envelope = Envelope::read(&mut self.input, &self.mak)?;
        let media_key = envelope
            .media_key
            .ok_or(DecodeError::EnvelopeMalformed("no plaintext chunk"))?;
        let pool = TuringPool::new(media_key);

        self.advance_to_mpeg_offset(envelope.header.mpeg_offset)?;
        debug!(
            "starting {:?} processing at position {}",
            envelope.header.format(),
            self.input.position()
        );

        match envelope.header.format() {
            Format::ProgramStream => {
                PsDecoder::new(&mut self.input, output, pool).process()?;
            }
            Format::TransportStream => {
                TsDecoder::new(
                    &mut self.input,
                    output,
                    pool,
                    self.options.compatibility_mode,
                )
                .process()?;
            }
        }

        Ok(envelope.chunks.into_iter().map(|c| c.data).collect())
    }

    /// Process the envelope only, returning the decrypted metadata chunk
    /// payloads without touching the MPEG payload.
    pub fn decode_metadata(mut self) -> Result<Vec<Vec<u8>>> {
        let envelope = Envelope::read(&mut self.input, &self.mak)?;
        Ok(envelope.chunks.into_iter().map(|c| c.data).collect())
    }

    fn advance_to_mpeg_offset(&mut self, mpeg_offset: u32) -> Result<()> {
        let position = self.input.position();
        let Some(to_skip) = (mpeg_offset as u64).checked_sub(position) else {
            error!("stream advanced past MPEG data (MPEG at {mpeg_offset}, position {position})");
            return Err(DecodeError::EnvelopeMalformed(
                "chunk table overruns the MPEG offset",
            ));
        };
        Ok(self.input.skip(to_skip)?)
    }
}

/// Decode `input` fully, writing the MPEG stream to `output`.
pub fn decode<R: Read, W: Write>(
    input: R,
    output: &mut W,
    mak: &str,
    options: DecoderOptions,
) -> Result<()> {
    TivoDecoder::new(input, mak, options).decode(output)?;
    Ok(())
}

/// Run envelope processing only and return the metadata documents, one byte
/// buffer per chunk.
pub fn decode_metadata<R: Read>(input: R, mak: &str) -> Result<Vec<Vec<u8>>> {
    TivoDecoder::new(input, mak, DecoderOptions::default()).decode_metadata()
}
