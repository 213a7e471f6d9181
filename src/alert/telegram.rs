// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/alert/telegram.rs - Telegram Bot 通知
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

//! 通过 Telegram Bot API 发送告警。
//!
//! URL 形如 `telegram://api.telegram.org/bot<TOKEN>?chat_id=<CHAT_ID>`，
//! 主机部分允许指向自建的 Bot API 服务。

use std::time::Duration;

use reqwest::{
  StatusCode,
  blocking::{
    Client, Response,
    multipart::{Form, Part},
  },
};
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  alert::{DeliveryError, Notifier, NotifierError},
};

const TELEGRAM_API_HOST: &str = "api.telegram.org";
const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(8);

pub struct TelegramNotifier {
  client: Client,
  api_base: String,
  token: String,
  chat_id: String,
}

impl FromUrlWithScheme for TelegramNotifier {
  const SCHEME: &'static str = "telegram";
}

impl FromUrl for TelegramNotifier {
  type Error = NotifierError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(NotifierError::SchemeMismatch(url.scheme().to_string()));
    }

    let host = url.host_str().unwrap_or(TELEGRAM_API_HOST);
    let api_base = match url.port() {
      Some(port) => format!("https://{}:{}", host, port),
      None => format!("https://{}", host),
    };
    let token = url
      .path()
      .trim_start_matches('/')
      .strip_prefix("bot")
      .filter(|t| !t.is_empty())
      .ok_or_else(|| NotifierError::InvalidUrl("缺少 /bot<TOKEN> 路径".to_string()))?
      .to_string();
    let chat_id = url
      .query_pairs()
      .find(|(k, _)| k == "chat_id")
      .map(|(_, v)| v.to_string())
      .ok_or_else(|| NotifierError::InvalidUrl("缺少 chat_id 参数".to_string()))?;

    Self::with_api_base(api_base, token, chat_id)
  }
}

impl TelegramNotifier {
  pub fn new(token: &str, chat_id: &str) -> Result<Self, NotifierError> {
    Self::with_api_base(
      format!("https://{}", TELEGRAM_API_HOST),
      token.to_string(),
      chat_id.to_string(),
    )
  }

  fn with_api_base(api_base: String, token: String, chat_id: String) -> Result<Self, NotifierError> {
    let client = Client::builder().timeout(TELEGRAM_TIMEOUT).build()?;
    Ok(Self {
      client,
      api_base,
      token,
      chat_id,
    })
  }

  fn endpoint(&self, method: &str) -> String {
    format!("{}/bot{}/{}", self.api_base, self.token, method)
  }

  fn check(response: Result<Response, reqwest::Error>) -> Result<(), DeliveryError> {
    // 错误信息中可能带有包含 token 的 URL
    let response = response.map_err(|e| DeliveryError::Network(e.without_url().to_string()))?;
    let status = response.status();
    if status.is_success() {
      return Ok(());
    }
    let body = response.text().unwrap_or_default();
    debug!("Telegram 返回 {}: {}", status, body);
    Err(match status {
      StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DeliveryError::Auth(body),
      StatusCode::TOO_MANY_REQUESTS => DeliveryError::RateLimited(body),
      _ => DeliveryError::Rejected(format!("{}: {}", status, body)),
    })
  }
}

impl Notifier for TelegramNotifier {
  fn send(&self, text: &str, image: Option<&[u8]>) -> Result<(), DeliveryError> {
    let response = match image {
      Some(jpeg) => {
        let photo = Part::bytes(jpeg.to_vec())
          .file_name("frame.jpg")
          .mime_str("image/jpeg")
          .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        let form = Form::new()
          .text("chat_id", self.chat_id.clone())
          .text("caption", text.to_string())
          .part("photo", photo);
        self
          .client
          .post(self.endpoint("sendPhoto"))
          .multipart(form)
          .send()
      }
      None => self
        .client
        .get(self.endpoint("sendMessage"))
        .query(&[("chat_id", self.chat_id.as_str()), ("text", text)])
        .send(),
    };
    Self::check(response)
  }
}
