// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/input.rs - 视频流输入
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{info, warn};

use crate::{FromUrl, frame::Frame};

mod backoff;
pub use self::backoff::{Backoff, BackoffConfig};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError, ImageFileStream};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

/// 单次拉流等待的最长时间，保证能及时响应退出信号
const PULL_SLICE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum StreamError {
  #[error("视频流不可用: {0}")]
  Unavailable(String),
  #[error("视频流停滞: {0:.1?} 内没有收到新帧")]
  Stalled(Duration),
  #[error("收到退出信号")]
  Shutdown,
}

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
}

/// 已建立的视频连接，析构时关闭连接
pub trait VideoStream {
  /// 最多等待 `timeout` 拉取一帧，超时返回 `Ok(None)`
  fn pull_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, StreamError>;

  fn fps(&self) -> Option<f64>;
}

impl<S: VideoStream + ?Sized> VideoStream for Box<S> {
  fn pull_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, StreamError> {
    (**self).pull_frame(timeout)
  }

  fn fps(&self) -> Option<f64> {
    (**self).fps()
  }
}

/// 可以反复建立连接的视频源
pub trait VideoConnector {
  type Stream: VideoStream;

  fn connect(&mut self) -> Result<Self::Stream, StreamError>;

  fn describe(&self) -> String;
}

/// 可被退出信号打断的等待
pub trait Sleeper {
  /// 等待 `duration`，被打断时返回 `false`
  fn sleep(&mut self, duration: Duration) -> bool;

  fn interrupted(&self) -> bool {
    false
  }
}

/// 以小步长睡眠并检查退出标志
#[derive(Debug, Clone, Default)]
pub struct InterruptibleSleeper {
  shutdown: Arc<AtomicBool>,
}

impl InterruptibleSleeper {
  pub fn new(shutdown: Arc<AtomicBool>) -> Self {
    Self { shutdown }
  }
}

impl Sleeper for InterruptibleSleeper {
  fn sleep(&mut self, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
      if self.interrupted() {
        return false;
      }
      let now = Instant::now();
      if now >= deadline {
        return true;
      }
      thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
  }

  fn interrupted(&self) -> bool {
    self.shutdown.load(Ordering::SeqCst)
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamConfig {
  pub stall_timeout: Duration,
  pub backoff: BackoffConfig,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      stall_timeout: Duration::from_secs(10),
      backoff: BackoffConfig::default(),
    }
  }
}

/// 带断线重连与停滞检测的视频源
///
/// `next_frame` 每次最多做一次连接尝试：连接失败返回 `Unavailable`，
/// 超过停滞超时没有新帧返回 `Stalled`。两种情况都会断开连接，
/// 下一次调用先按退避时间等待再重连。
pub struct StreamSource<C: VideoConnector> {
  connector: C,
  config: StreamConfig,
  backoff: Backoff,
  pending_delay: Option<Duration>,
  stream: Option<C::Stream>,
  last_frame_at: Instant,
  sleeper: Box<dyn Sleeper>,
}

impl<C: VideoConnector> StreamSource<C> {
  pub fn new(connector: C, config: StreamConfig) -> Self {
    Self::with_sleeper(connector, config, Box::new(InterruptibleSleeper::default()))
  }

  pub fn with_sleeper(connector: C, config: StreamConfig, sleeper: Box<dyn Sleeper>) -> Self {
    Self {
      connector,
      backoff: Backoff::new(config.backoff),
      config,
      pending_delay: None,
      stream: None,
      last_frame_at: Instant::now(),
      sleeper,
    }
  }

  pub fn is_connected(&self) -> bool {
    self.stream.is_some()
  }

  pub fn fps(&self) -> Option<f64> {
    self.stream.as_ref().and_then(|s| s.fps())
  }

  /// 断开当前连接
  pub fn close(&mut self) {
    if self.stream.take().is_some() {
      info!("已关闭视频流 {}", self.connector.describe());
    }
  }

  fn fail(&mut self, error: StreamError) -> StreamError {
    self.stream = None;
    let delay = self.backoff.next_delay();
    warn!(
      "{}，{:.1?} 后进行第 {} 次重连",
      error,
      delay,
      self.backoff.failures()
    );
    self.pending_delay = Some(delay);
    error
  }

  fn ensure_connected(&mut self) -> Result<(), StreamError> {
    if self.stream.is_some() {
      return Ok(());
    }

    if let Some(delay) = self.pending_delay.take()
      && !self.sleeper.sleep(delay)
    {
      return Err(StreamError::Shutdown);
    }

    info!("连接视频流 {}", self.connector.describe());
    match self.connector.connect() {
      Ok(stream) => {
        self.stream = Some(stream);
        self.last_frame_at = Instant::now();
        info!("视频流已连接");
        Ok(())
      }
      Err(e) => Err(self.fail(e)),
    }
  }

  pub fn next_frame(&mut self) -> Result<Frame, StreamError> {
    self.ensure_connected()?;

    loop {
      if self.sleeper.interrupted() {
        return Err(StreamError::Shutdown);
      }

      let waited = self.last_frame_at.elapsed();
      if waited >= self.config.stall_timeout {
        return Err(self.fail(StreamError::Stalled(waited)));
      }
      let timeout = (self.config.stall_timeout - waited).min(PULL_SLICE);

      let Some(stream) = self.stream.as_mut() else {
        return Err(self.fail(StreamError::Unavailable("连接已断开".to_string())));
      };
      match stream.pull_frame(timeout) {
        Ok(Some(frame)) => {
          self.last_frame_at = Instant::now();
          if self.backoff.failures() > 0 {
            info!("视频流已恢复");
            self.backoff.reset();
          }
          return Ok(frame);
        }
        Ok(None) => continue,
        Err(StreamError::Shutdown) => return Err(StreamError::Shutdown),
        Err(e) => return Err(self.fail(e)),
      }
    }
  }

  /// 反复重试直到拿到一帧，只有退出信号会返回错误
  pub fn next_frame_resilient(&mut self) -> Result<Frame, StreamError> {
    loop {
      match self.next_frame() {
        Ok(frame) => return Ok(frame),
        Err(StreamError::Shutdown) => return Err(StreamError::Shutdown),
        Err(_) => continue,
      }
    }
  }
}

#[cfg(not(any(feature = "gstreamer_input", feature = "read_image_file")))]
compile_error!("至少需要启用一个视频输入特性: gstreamer_input 或 read_image_file");

/// 根据 URL 选择视频源
pub enum InputWrapper {
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInputPipelineBuilder),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "gstreamer_input")]
    {
      if GStreamerInputPipelineBuilder::accepts(url.scheme()) {
        let builder = GStreamerInputPipelineBuilder::from_url(url)?;
        return Ok(InputWrapper::GStreamerInput(builder));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl VideoConnector for InputWrapper {
  type Stream = Box<dyn VideoStream>;

  fn connect(&mut self) -> Result<Self::Stream, StreamError> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => Ok(Box::new(input.connect()?)),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => Ok(Box::new(input.connect()?)),
    }
  }

  fn describe(&self) -> String {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.describe(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.describe(),
    }
  }
}
