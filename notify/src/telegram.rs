//! Telegram Bot API sender.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use log::debug;

use crate::encoding::win1251_to_utf8;
use crate::multipart::Multipart;
use crate::transfer::TransferQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    #[default]
    Html,
    Markdown,
}

impl ParseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseMode::Html => "HTML",
            ParseMode::Markdown => "Markdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Photo,
    Audio,
    Document,
    Video,
}

impl FileType {
    /// Bot API method for this media kind.
    pub fn method(self) -> &'static str {
        match self {
            FileType::Photo => "sendPhoto",
            FileType::Audio => "sendAudio",
            FileType::Document => "sendDocument",
            FileType::Video => "sendVideo",
        }
    }

    /// Form field carrying the file.
    pub fn field(self) -> &'static str {
        match self {
            FileType::Photo => "photo",
            FileType::Audio => "audio",
            FileType::Document => "document",
            FileType::Video => "video",
        }
    }

    /// MIME type sent with the file part.
    pub fn mime(self) -> &'static str {
        match self {
            FileType::Photo => "image",
            FileType::Audio => "audio",
            FileType::Document => "application",
            FileType::Video => "video",
        }
    }
}

fn api_url(token: &str, method: &str) -> String {
    format!("https://api.telegram.org/bot{token}/{method}")
}

pub struct TelegramSender {
    queue: Arc<TransferQueue>,
}

impl TelegramSender {
    pub fn new(queue: Arc<TransferQueue>) -> Self {
        Self { queue }
    }

    /// `sendMessage`. `text` is cp1251 game text and gets converted on the
    /// way out.
    pub fn send_message(
        &self,
        token: &str,
        chat_id: &str,
        text: &[u8],
        parse_mode: ParseMode,
        disable_notification: bool,
        protect_content: bool,
    ) -> Result<()> {
        let form = message_form(chat_id, text, parse_mode, disable_notification, protect_content);
        debug!("telegram sendMessage to chat {chat_id}");
        let content_type = form.content_type();
        self.queue
            .submit(&api_url(token, "sendMessage"), &content_type, form.finish())
    }

    /// `sendPhoto`/`sendAudio`/`sendDocument`/`sendVideo`, picked by
    /// `file_type`. The file is read here; a missing file fails the send
    /// before anything is queued.
    #[allow(clippy::too_many_arguments)]
    pub fn send_media(
        &self,
        file_type: FileType,
        token: &str,
        chat_id: &str,
        file_path: &Path,
        caption: &[u8],
        parse_mode: ParseMode,
        disable_notification: bool,
        protect_content: bool,
    ) -> Result<()> {
        let form = media_form(
            file_type,
            chat_id,
            file_path,
            caption,
            parse_mode,
            disable_notification,
            protect_content,
        )?;
        debug!(
            "telegram {} to chat {chat_id} ({})",
            file_type.method(),
            file_path.display()
        );
        let content_type = form.content_type();
        self.queue
            .submit(&api_url(token, file_type.method()), &content_type, form.finish())
    }
}

fn message_form(
    chat_id: &str,
    text: &[u8],
    parse_mode: ParseMode,
    disable_notification: bool,
    protect_content: bool,
) -> Multipart {
    let mut form = Multipart::new();
    form.add_text("chat_id", chat_id)
        .add_text("text", &win1251_to_utf8(text))
        .add_text("parse_mode", parse_mode.as_str());
    if disable_notification {
        form.add_text("disable_notification", "true");
    }
    if protect_content {
        form.add_text("protect_content", "true");
    }
    form
}

fn media_form(
    file_type: FileType,
    chat_id: &str,
    file_path: &Path,
    caption: &[u8],
    parse_mode: ParseMode,
    disable_notification: bool,
    protect_content: bool,
) -> Result<Multipart> {
    let mut form = Multipart::new();
    form.add_text("chat_id", chat_id);
    form.add_file(file_type.field(), file_path, file_type.mime())?;
    form.add_text("caption", &win1251_to_utf8(caption))
        .add_text("parse_mode", parse_mode.as_str());
    if disable_notification {
        form.add_text("disable_notification", "true");
    }
    if protect_content {
        form.add_text("protect_content", "true");
    }
    Ok(form)
}
