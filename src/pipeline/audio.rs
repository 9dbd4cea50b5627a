use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::bail;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded};
use tracing::{debug, info};

use super::{PipelineContext, SharedDemuxer};
use crate::backend::{Demuxer, MediaBackend};
use crate::codec::{Codec, CodecEvent, CodecHandler, CodecInput, CodecWorker};
use crate::error::CompressError;
use crate::media::{BufferFlags, MediaFormat, Sample, TrackKind};

const DEFAULT_CHANNELS: u16 = 2;
const MAX_SAMPLE_RATE: u32 = 48_000;
const MAX_BITRATE: u64 = 128_000;
const INPUT_SIZE_STEP: usize = 4096;

/// AAC encoder settings derived from the source track and the size of the
/// first decoded chunk.
pub(crate) fn audio_encoder_format(source: &MediaFormat, first_chunk: usize) -> MediaFormat {
    let channels = source.channels.unwrap_or(DEFAULT_CHANNELS);
    let sample_rate = source.sample_rate.unwrap_or(MAX_SAMPLE_RATE).min(MAX_SAMPLE_RATE);
    let bitrate = source.bitrate.unwrap_or(MAX_BITRATE).min(MAX_BITRATE);
    let max_input_size = first_chunk.max(1).div_ceil(INPUT_SIZE_STEP) * INPUT_SIZE_STEP;
    MediaFormat::audio("aac", Some(sample_rate), Some(channels))
        .with_bitrate(bitrate)
        .with_max_input_size(max_input_size)
}

/// Decoded PCM chunks between the audio decoder and the audio encoder.
struct ChunkQueue {
    tx: Sender<Sample>,
    rx: Receiver<Sample>,
    decode_ended: AtomicBool,
}

impl ChunkQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            decode_ended: AtomicBool::new(false),
        }
    }

    /// Blocks while the queue is full; gives up once the pipeline stops.
    fn push(&self, mut chunk: Sample, cancelled: &AtomicBool, poll: Duration) {
        loop {
            match self.tx.send_timeout(chunk, poll) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) => {
                    if cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    chunk = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }

    /// The next chunk to encode: a queued chunk, end of stream once decoding
    /// ended and the queue ran dry, or an empty sample to try again later.
    fn next(&self, poll: Duration) -> Sample {
        if let Ok(chunk) = self.rx.recv_timeout(poll) {
            return chunk;
        }
        if self.decode_ended.load(Ordering::Acquire) {
            return self.rx.try_recv().unwrap_or_else(|_| Sample::end_of_stream(0));
        }
        Sample::empty()
    }

    fn clear(&self) -> usize {
        std::iter::from_fn(|| self.rx.try_recv().ok()).count()
    }
}

pub(crate) struct AudioTrack {
    job_id: String,
    decoder: Arc<CodecWorker>,
    encoder: Arc<CodecWorker>,
    demuxer: SharedDemuxer,
    queue: Arc<ChunkQueue>,
}

impl AudioTrack {
    /// Starts the decoder. The encoder is configured from the decoder's first
    /// output buffer.
    pub fn start(
        context: &Arc<PipelineContext>,
        backend: &dyn MediaBackend,
        demuxer: Box<dyn Demuxer>,
    ) -> Result<Self, CompressError> {
        let job_id = context.job_id.clone();
        let source = demuxer.format().clone();
        let demuxer = SharedDemuxer::new(demuxer);
        let queue = Arc::new(ChunkQueue::new(context.settings.audio_queue_capacity));

        let encoder_codec = backend
            .create_encoder(&audio_encoder_format(&source, INPUT_SIZE_STEP))
            .map_err(|error| CompressError::configuration(error.context("create audio encoder")))?;
        let encoder = Arc::new(
            CodecWorker::spawn(
                format!("audio-encoder-{job_id}"),
                encoder_codec,
                Box::new(AudioEncodeHandler {
                    context: context.clone(),
                    queue: queue.clone(),
                    input_ended: false,
                }),
            )
            .map_err(CompressError::internal)?,
        );

        let decoder_codec = backend
            .create_decoder(&source)
            .map_err(|error| CompressError::configuration(error.context("create audio decoder")))?;
        let decoder = Arc::new(
            CodecWorker::spawn(
                format!("audio-decoder-{job_id}"),
                decoder_codec,
                Box::new(AudioDecodeHandler {
                    context: context.clone(),
                    demuxer: demuxer.clone(),
                    queue: queue.clone(),
                    encoder: encoder.clone(),
                    source: source.clone(),
                    input_ended: false,
                    encoder_started: false,
                }),
            )
            .map_err(CompressError::internal)?,
        );
        decoder.configure(source, None, CodecInput::Buffers)?;
        decoder.start()?;
        info!(job_id = %job_id, "audio track started");

        Ok(Self {
            job_id,
            decoder,
            encoder,
            demuxer,
            queue,
        })
    }

    /// Drops queued chunks, then releases the decoder and the encoder.
    pub fn release_codecs(&self) {
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!(job_id = %self.job_id, dropped, "discarded queued audio");
        }
        self.decoder.release();
        self.encoder.release();
    }

    pub fn release_demuxer(&self) {
        self.demuxer.release();
    }
}

struct AudioDecodeHandler {
    context: Arc<PipelineContext>,
    demuxer: SharedDemuxer,
    queue: Arc<ChunkQueue>,
    encoder: Arc<CodecWorker>,
    source: MediaFormat,
    input_ended: bool,
    encoder_started: bool,
}

impl CodecHandler for AudioDecodeHandler {
    fn on_event(&mut self, codec: &mut dyn Codec, event: CodecEvent) -> anyhow::Result<()> {
        match event {
            CodecEvent::InputReady(buffer) => {
                if self.input_ended || self.context.is_cancelled() {
                    return Ok(());
                }
                let sample = self.demuxer.next_sample()?;
                self.input_ended = sample.is_end_of_stream();
                codec.queue_input(buffer, sample)?;
            }
            CodecEvent::OutputReady(buffer, info) => {
                let mut chunk_size = INPUT_SIZE_STEP;
                if info.size > 0 {
                    let data = codec.output(buffer).unwrap_or_default();
                    chunk_size = data.len();
                    let chunk = Sample {
                        data,
                        pts_us: info.pts_us,
                        flags: info.flags.without(BufferFlags::END_OF_STREAM),
                    };
                    self.queue.push(
                        chunk,
                        &self.context.cancelled,
                        self.context.settings.queue_poll,
                    );
                }
                if !self.encoder_started {
                    self.encoder_started = true;
                    let format = audio_encoder_format(&self.source, chunk_size);
                    debug!(
                        job_id = %self.context.job_id,
                        sample_rate = format.sample_rate,
                        channels = format.channels,
                        max_input_size = format.max_input_size,
                        "configuring audio encoder"
                    );
                    self.encoder.configure(format, None, CodecInput::Buffers)?;
                    self.encoder.start()?;
                }
                codec.release_output(buffer, false)?;
                if info.is_end_of_stream() {
                    self.queue.decode_ended.store(true, Ordering::Release);
                    debug!(job_id = %self.context.job_id, "audio decode finished");
                }
            }
            CodecEvent::FormatChanged(format) => {
                debug!(job_id = %self.context.job_id, sample_rate = format.sample_rate, channels = format.channels, "audio decoder output format");
            }
            CodecEvent::Error(reason) => bail!(reason),
        }
        Ok(())
    }

    fn on_failure(&mut self, error: anyhow::Error) {
        self.context.fail("audio decoder", error);
    }
}

struct AudioEncodeHandler {
    context: Arc<PipelineContext>,
    queue: Arc<ChunkQueue>,
    input_ended: bool,
}

impl CodecHandler for AudioEncodeHandler {
    fn on_event(&mut self, codec: &mut dyn Codec, event: CodecEvent) -> anyhow::Result<()> {
        match event {
            CodecEvent::InputReady(buffer) => {
                if self.input_ended || self.context.is_cancelled() {
                    return Ok(());
                }
                let chunk = self.queue.next(self.context.settings.queue_poll);
                self.input_ended = chunk.is_end_of_stream();
                codec.queue_input(buffer, chunk)?;
            }
            CodecEvent::OutputReady(buffer, info) => {
                self.context.write_encoded(TrackKind::Audio, codec, buffer, info)?;
            }
            CodecEvent::FormatChanged(format) => {
                self.context.muxer.add_track(TrackKind::Audio, &format)?;
            }
            CodecEvent::Error(reason) => bail!(reason),
        }
        Ok(())
    }

    fn on_failure(&mut self, error: anyhow::Error) {
        self.context.fail("audio encoder", error);
    }
}
