use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::anyhow;
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use super::{Codec, CodecEvent, CodecInput};
use crate::error::CompressError;
use crate::media::MediaFormat;
use crate::surface::FrameSink;

/// Reacts to the events of one codec. Runs on that codec's worker thread with
/// the worker's lock held.
pub trait CodecHandler: Send + 'static {
    fn on_event(&mut self, codec: &mut dyn Codec, event: CodecEvent) -> anyhow::Result<()>;

    /// Called with any error returned by [`CodecHandler::on_event`].
    fn on_failure(&mut self, error: anyhow::Error);
}

/// The codec together with its released guard. Every access goes through the
/// worker's mutex and checks the guard first.
pub struct CodecSlot {
    codec: Box<dyn Codec>,
    released: bool,
}

impl CodecSlot {
    /// The codec, unless it has been released.
    pub fn codec(&mut self) -> Option<&mut dyn Codec> {
        if self.released {
            return None;
        }
        let codec: &mut dyn Codec = self.codec.as_mut();
        Some(codec)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn release(&mut self, worker: &str) {
        if self.released {
            return;
        }
        self.codec.stop();
        self.codec.release();
        self.released = true;
        debug!(worker, "codec stopped and released");
    }
}

enum Control {
    Configure {
        format: MediaFormat,
        sink: Option<FrameSink>,
        input: CodecInput,
        reply: Sender<anyhow::Result<()>>,
    },
    Start {
        reply: Sender<anyhow::Result<()>>,
    },
    Release {
        reply: Sender<()>,
    },
}

/// Owns one codec and the dedicated thread all of its lifecycle calls and
/// event handling run on.
pub struct CodecWorker {
    name: String,
    slot: Arc<Mutex<CodecSlot>>,
    control: Sender<Control>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CodecWorker {
    pub fn spawn(
        name: impl Into<String>,
        codec: Box<dyn Codec>,
        handler: Box<dyn CodecHandler>,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let slot = Arc::new(Mutex::new(CodecSlot {
            codec,
            released: false,
        }));
        let (control_tx, control_rx) = unbounded();

        let thread = std::thread::Builder::new().name(name.clone()).spawn({
            let name = name.clone();
            let slot = slot.clone();
            move || run(&name, &slot, control_rx, handler)
        })?;

        Ok(Self {
            name,
            slot,
            control: control_tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn configure(
        &self,
        format: MediaFormat,
        sink: Option<FrameSink>,
        input: CodecInput,
    ) -> Result<(), CompressError> {
        let (reply, result) = bounded(1);
        self.request(
            Control::Configure {
                format,
                sink,
                input,
                reply,
            },
            result,
        )
        .map_err(|error| CompressError::configuration(error.context(format!("configure {}", self.name))))
    }

    pub fn start(&self) -> Result<(), CompressError> {
        let (reply, result) = bounded(1);
        self.request(Control::Start { reply }, result)
            .map_err(|error| CompressError::configuration(error.context(format!("start {}", self.name))))
    }

    fn request(
        &self,
        control: Control,
        result: Receiver<anyhow::Result<()>>,
    ) -> anyhow::Result<()> {
        self.control
            .send(control)
            .map_err(|_| anyhow!("{} worker has exited", self.name))?;
        result
            .recv()
            .map_err(|_| anyhow!("{} worker has exited", self.name))?
    }

    /// Runs `f` on the codec under the worker's lock, unless it was released.
    pub fn with_codec<R>(&self, f: impl FnOnce(&mut dyn Codec) -> R) -> Option<R> {
        let mut slot = self.slot.lock();
        match slot.codec() {
            Some(codec) => Some(f(codec)),
            None => None,
        }
    }

    /// Holds the worker's lock across several codec calls.
    pub fn lock(&self) -> MutexGuard<'_, CodecSlot> {
        self.slot.lock()
    }

    pub fn is_released(&self) -> bool {
        self.slot.lock().is_released()
    }

    /// Stops and releases the codec on its own thread, then joins the thread.
    /// Later calls do nothing.
    pub fn release(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            self.slot.lock().release(&self.name);
            return;
        }
        let (reply, done) = bounded(1);
        if self.control.send(Control::Release { reply }).is_ok() {
            _ = done.recv();
        }
        if thread.join().is_err() {
            error!(worker = %self.name, "codec worker panicked");
        }
        // the thread releases on exit; make sure even if it died early
        self.slot.lock().release(&self.name);
    }
}

impl Drop for CodecWorker {
    fn drop(&mut self) {
        self.release();
    }
}

fn run(
    name: &str,
    slot: &Mutex<CodecSlot>,
    control: Receiver<Control>,
    mut handler: Box<dyn CodecHandler>,
) {
    let (events_tx, events) = unbounded::<CodecEvent>();
    debug!(worker = name, "codec worker started");

    loop {
        select! {
            recv(control) -> command => match command {
                Ok(Control::Configure { format, sink, input, reply }) => {
                    let result = match slot.lock().codec() {
                        Some(codec) => codec.configure(&format, sink, input),
                        None => Err(anyhow!("{name} is released")),
                    };
                    _ = reply.send(result);
                }
                Ok(Control::Start { reply }) => {
                    let result = match slot.lock().codec() {
                        Some(codec) => codec.start(events_tx.clone()),
                        None => Err(anyhow!("{name} is released")),
                    };
                    _ = reply.send(result);
                }
                Ok(Control::Release { reply }) => {
                    slot.lock().release(name);
                    _ = reply.send(());
                    break;
                }
                Err(_) => {
                    slot.lock().release(name);
                    break;
                }
            },
            recv(events) -> event => {
                let Ok(event) = event else {
                    continue;
                };
                let result = {
                    let mut slot = slot.lock();
                    match slot.codec() {
                        Some(codec) => handler.on_event(codec, event),
                        None => Ok(()),
                    }
                };
                if let Err(error) = result {
                    warn!(worker = name, error = %format!("{error:#}"), "codec event failed");
                    handler.on_failure(error);
                }
            }
        }
    }

    debug!(worker = name, "codec worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BufferedCodec, Payload, Transform};
    use crate::media::{BufferFlags, Sample};
    use std::time::Duration;

    struct Passthrough;

    impl Transform for Passthrough {
        fn open(&mut self, format: &MediaFormat) -> anyhow::Result<MediaFormat> {
            if format.codec == "unsupported" {
                anyhow::bail!("no such codec");
            }
            Ok(format.clone())
        }

        fn push(&mut self, input: Payload) -> anyhow::Result<Vec<Payload>> {
            Ok(vec![input])
        }

        fn flush(&mut self) -> anyhow::Result<Vec<Payload>> {
            Ok(Vec::new())
        }
    }

    /// Feeds three samples then end of stream, reporting each output's pts.
    struct Feeder {
        fed: i64,
        outputs: Sender<i64>,
        failures: Sender<String>,
    }

    impl CodecHandler for Feeder {
        fn on_event(&mut self, codec: &mut dyn Codec, event: CodecEvent) -> anyhow::Result<()> {
            match event {
                CodecEvent::InputReady(buffer) => {
                    let sample = if self.fed < 3 {
                        Sample::new(vec![1u8; 4], self.fed * 10, BufferFlags::NONE)
                    } else {
                        Sample::end_of_stream(self.fed * 10)
                    };
                    self.fed += 1;
                    if self.fed <= 4 {
                        codec.queue_input(buffer, sample)?;
                    }
                }
                CodecEvent::OutputReady(buffer, info) => {
                    codec.release_output(buffer, false)?;
                    if info.is_end_of_stream() {
                        _ = self.outputs.send(-1);
                    } else {
                        _ = self.outputs.send(info.pts_us);
                    }
                }
                CodecEvent::FormatChanged(_) => {}
                CodecEvent::Error(reason) => anyhow::bail!(reason),
            }
            Ok(())
        }

        fn on_failure(&mut self, error: anyhow::Error) {
            _ = self.failures.send(error.to_string());
        }
    }

    fn worker() -> (CodecWorker, Receiver<i64>, Receiver<String>) {
        let (outputs, outputs_rx) = unbounded();
        let (failures, failures_rx) = unbounded();
        let codec = Box::new(BufferedCodec::new("test-codec", Box::new(Passthrough)));
        let handler = Box::new(Feeder {
            fed: 0,
            outputs,
            failures,
        });
        let worker = CodecWorker::spawn("test-worker", codec, handler).unwrap();
        (worker, outputs_rx, failures_rx)
    }

    #[test]
    fn test_events_flow_to_handler() {
        let (worker, outputs, _failures) = worker();
        worker
            .configure(MediaFormat::audio("pcm", Some(8_000), Some(1)), None, CodecInput::Buffers)
            .unwrap();
        worker.start().unwrap();

        let mut seen = Vec::new();
        while let Ok(pts) = outputs.recv_timeout(Duration::from_secs(2)) {
            seen.push(pts);
            if pts == -1 {
                break;
            }
        }
        assert_eq!(seen, vec![0, 10, 20, -1]);
        worker.release();
    }

    #[test]
    fn test_configure_error_is_configuration_kind() {
        let (worker, _outputs, _failures) = worker();
        let error = worker
            .configure(MediaFormat::video("unsupported", 2, 2), None, CodecInput::Buffers)
            .unwrap_err();
        assert_eq!(error.kind(), crate::error::ErrorKind::ConfigurationError);
        assert!(error.to_string().contains("no such codec"));
    }

    #[test]
    fn test_release_is_idempotent_and_guards_access() {
        let (worker, _outputs, _failures) = worker();
        assert!(worker.with_codec(|codec| codec.name().to_string()).is_some());
        worker.release();
        worker.release();
        assert!(worker.is_released());
        assert!(worker.with_codec(|codec| codec.name().to_string()).is_none());
        assert!(worker.start().is_err());
    }
}
