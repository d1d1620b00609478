use super::{Backend, ComputeError, Result};

/// Where the command stream currently stands.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EncoderState {
    /// No command stream is open.
    #[default]
    Idle,
    /// A stream is open but no compute pass is recording.
    Streaming,
    /// A compute pass is recording inside the open stream.
    Encoding,
}

/// Owns the single in-flight command stream and its encoder state.
///
/// Streams are opened lazily and numbered by a serial that advances each
/// time one is finished, so resources can tell whether the stream that is
/// still recording references them.
pub(crate) struct CommandController<B: Backend> {
    state: EncoderState,
    stream: Option<B::Stream>,
    serial: u64,
}

impl<B: Backend> Default for CommandController<B> {
    fn default() -> Self {
        Self {
            state: EncoderState::Idle,
            stream: None,
            serial: 1,
        }
    }
}

impl<B: Backend> CommandController<B> {
    pub fn state(&self) -> EncoderState {
        self.state
    }

    /// Serial of the open stream, or of the next one to open.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether a resource last used at `serial` is referenced by unsubmitted work.
    pub fn references(&self, serial: u64) -> bool {
        self.state != EncoderState::Idle && serial == self.serial
    }

    /// Idle -> Streaming. No-op when a stream is already open.
    pub fn ensure_stream(&mut self, backend: &mut B) -> Result<&mut B::Stream> {
        if self.state == EncoderState::Idle {
            self.stream = Some(backend.begin_stream()?);
            self.state = EncoderState::Streaming;
            log::debug!("command stream {} opened", self.serial);
        }

        self.stream
            .as_mut()
            .ok_or_else(|| ComputeError::invalid("command stream missing while not idle"))
    }

    /// Opens a compute pass, starting the stream first if needed.
    pub fn ensure_encoding(&mut self, backend: &mut B) -> Result<&mut B::Stream> {
        self.ensure_stream(backend)?;
        if self.state == EncoderState::Streaming {
            if let Some(stream) = self.stream.as_mut() {
                backend.begin_compute_pass(stream)?;
            }
            self.state = EncoderState::Encoding;
            log::debug!("compute pass opened in stream {}", self.serial);
        }

        self.stream
            .as_mut()
            .ok_or_else(|| ComputeError::invalid("command stream missing while encoding"))
    }

    /// The open stream, provided a compute pass is recording.
    pub fn encoding_stream(&mut self, what: &str) -> Result<&mut B::Stream> {
        if self.state != EncoderState::Encoding {
            return Err(ComputeError::invalid(format!(
                "{} requires a bound kernel (encoder is {:?})",
                what, self.state
            )));
        }

        self.stream
            .as_mut()
            .ok_or_else(|| ComputeError::invalid("command stream missing while encoding"))
    }

    /// Encoding -> Streaming. Returns whether a pass was actually closed.
    pub fn flush_encoders(&mut self, backend: &mut B) -> bool {
        if self.state != EncoderState::Encoding {
            return false;
        }

        if let Some(stream) = self.stream.as_mut() {
            backend.end_compute_pass(stream);
        }
        self.state = EncoderState::Streaming;
        log::debug!("compute pass closed in stream {}", self.serial);
        true
    }

    /// Streaming/Encoding -> Idle: submit and block until the device is done.
    ///
    /// The stream is consumed even when submission fails; the controller
    /// always ends up idle.
    pub fn finish_work(&mut self, backend: &mut B) -> Result<()> {
        if self.state == EncoderState::Idle {
            return Ok(());
        }

        self.flush_encoders(backend);
        let stream = self.stream.take();
        self.state = EncoderState::Idle;
        let serial = self.serial;
        self.serial += 1;

        let res = match stream {
            Some(stream) => backend.submit_and_wait(stream),
            None => Ok(()),
        };

        match &res {
            Ok(()) => log::debug!("command stream {} completed", serial),
            Err(err) => log::error!("command stream {} failed: {}", serial, err),
        }
        res
    }
}
