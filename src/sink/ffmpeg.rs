//! A sink that pipes PCM into an `ffmpeg` child process.

use super::{Sink, VoiceData};
use crate::{constants::CHILD_KILL_GRACE, id::UserId};
use std::{
    io::{Error as IoError, Read, Write},
    process::{Child, ChildStdin, Command, Stdio},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};
use parking_lot::Mutex;
use tracing::{debug, error, info};

/// Callback invoked when the transcoder pipe breaks mid-write.
pub type ErrorHook = Box<dyn FnMut(&IoError) + Send>;

/// Configures and spawns an [`FfmpegSink`].
pub struct FfmpegSinkBuilder {
    executable: String,
    before_options: Vec<String>,
    options: Vec<String>,
    capture_stderr: bool,
    error_hook: Option<ErrorHook>,
}

impl Default for FfmpegSinkBuilder {
    fn default() -> Self {
        Self {
            executable: "ffmpeg".into(),
            before_options: Vec::new(),
            options: Vec::new(),
            capture_stderr: false,
            error_hook: None,
        }
    }
}

impl FfmpegSinkBuilder {
    /// Overrides the transcoder executable.
    #[must_use]
    pub fn executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Arguments placed before the input specification.
    #[must_use]
    pub fn before_options<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.before_options = args.into_iter().map(Into::into).collect();
        self
    }

    /// Arguments placed after the input specification; use these to pick
    /// the output container/codec.
    #[must_use]
    pub fn options<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = args.into_iter().map(Into::into).collect();
        self
    }

    /// Captures the child's stderr into a buffer readable after cleanup.
    #[must_use]
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    /// Installs a callback fired when writing to the child fails.
    #[must_use]
    pub fn error_hook(mut self, hook: ErrorHook) -> Self {
        self.error_hook = Some(hook);
        self
    }

    /// Spawns the transcoder writing to a file at `path`.
    pub fn file(self, path: impl Into<String>) -> Result<FfmpegSink, IoError> {
        self.spawn(path.into(), false)
    }

    /// Spawns the transcoder writing to an in-memory buffer, retrievable
    /// via [`FfmpegSink::take_buffer`] once recording stops.
    pub fn buffer(self) -> Result<FfmpegSink, IoError> {
        self.spawn("pipe:1".into(), true)
    }

    fn spawn(self, output: String, pipe_stdout: bool) -> Result<FfmpegSink, IoError> {
        let mut command = Command::new(&self.executable);
        command
            .arg("-hide_banner")
            .args(&self.before_options)
            .args(["-f", "s16le", "-ar", "48000", "-ac", "2", "-i", "pipe:0"])
            .args(["-loglevel", "warning"])
            .args(&self.options)
            .arg(&output)
            .stdin(Stdio::piped())
            .stdout(if pipe_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(if self.capture_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        debug!("Spawning transcoder: {command:?}");
        let mut process = command.spawn()?;

        let stdin = process.stdin.take();
        let mut sink = FfmpegSink {
            process: Some(process),
            stdin,
            buffer: None,
            stderr_buffer: None,
            readers: Vec::new(),
            error_hook: self.error_hook,
        };

        if pipe_stdout {
            let stdout = sink
                .process
                .as_mut()
                .and_then(|p| p.stdout.take())
                .ok_or_else(|| IoError::other("transcoder stdout was not piped"))?;
            let buffer = Arc::new(Mutex::new(Vec::new()));
            sink.buffer = Some(Arc::clone(&buffer));
            sink.readers.push(spawn_pipe_reader(stdout, buffer));
        }

        if self.capture_stderr {
            if let Some(stderr) = sink.process.as_mut().and_then(|p| p.stderr.take()) {
                let buffer = Arc::new(Mutex::new(Vec::new()));
                sink.stderr_buffer = Some(Arc::clone(&buffer));
                sink.readers.push(spawn_pipe_reader(stderr, buffer));
            }
        }

        Ok(sink)
    }
}

/// Streams decoded PCM into a transcoder subprocess.
///
/// Input is always s16-le 48 kHz stereo on the child's stdin; output goes
/// to a file or an in-memory buffer depending on how the sink was built.
pub struct FfmpegSink {
    process: Option<Child>,
    stdin: Option<ChildStdin>,
    buffer: Option<Arc<Mutex<Vec<u8>>>>,
    stderr_buffer: Option<Arc<Mutex<Vec<u8>>>>,
    readers: Vec<JoinHandle<()>>,
    error_hook: Option<ErrorHook>,
}

impl FfmpegSink {
    /// Starts configuring a transcoder sink.
    #[must_use]
    pub fn builder() -> FfmpegSinkBuilder {
        FfmpegSinkBuilder::default()
    }

    /// Takes the transcoded output collected so far.
    ///
    /// Meaningful only for buffer-backed sinks, after recording has
    /// stopped and cleanup has run.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.buffer
            .as_ref()
            .map(|buffer| std::mem::take(&mut *buffer.lock()))
    }

    /// Takes whatever the child wrote to stderr.
    pub fn take_stderr(&mut self) -> Option<Vec<u8>> {
        self.stderr_buffer
            .as_ref()
            .map(|buffer| std::mem::take(&mut *buffer.lock()))
    }

    fn kill_process(&mut self) {
        // Dropping stdin closes the pipe, letting the child flush and exit.
        drop(self.stdin.take());

        if let Some(mut child) = self.process.take() {
            let deadline = Instant::now() + CHILD_KILL_GRACE;
            let exited = loop {
                match child.try_wait() {
                    Ok(Some(status)) => break Some(status),
                    Ok(None) if Instant::now() < deadline => {
                        thread::sleep(std::time::Duration::from_millis(100));
                    },
                    Ok(None) => break None,
                    Err(e) => {
                        debug!("Error polling transcoder exit: {e}.");
                        break None;
                    },
                }
            };

            match exited {
                Some(status) => info!("Transcoder exited with {status}."),
                None => {
                    info!("Transcoder missed its exit grace period; killing.");
                    if let Err(e) = child.kill() {
                        error!("Failed to kill transcoder: {e}.");
                    }
                    drop(child.wait());
                },
            }
        }

        for reader in self.readers.drain(..) {
            drop(reader.join());
        }
    }
}

impl Sink for FfmpegSink {
    fn write(&mut self, _user: Option<UserId>, data: &VoiceData) {
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        let Some(bytes) = data.pcm_bytes() else {
            return;
        };

        if let Err(e) = stdin.write_all(&bytes) {
            error!("Error while writing audio to transcoder stdin: {e}.");
            if let Some(hook) = self.error_hook.as_mut() {
                hook(&e);
            }
            self.kill_process();
        }
    }

    fn cleanup(&mut self) {
        self.kill_process();
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        self.kill_process();
    }
}

fn spawn_pipe_reader(mut source: impl Read + Send + 'static, dest: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match source.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => dest.lock().extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!("Transcoder pipe closed: {e}.");
                    return;
                },
            }
        }
    })
}
