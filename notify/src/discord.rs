//! Discord webhook sender.

use std::sync::Arc;

use anyhow::Result;
use log::debug;

use crate::encoding::win1251_to_utf8;
use crate::multipart::Multipart;
use crate::transfer::TransferQueue;

pub struct DiscordSender {
    queue: Arc<TransferQueue>,
}

impl DiscordSender {
    pub fn new(queue: Arc<TransferQueue>) -> Self {
        Self { queue }
    }

    /// Post a message to a webhook. `content` and `username` are cp1251
    /// game text and get converted on the way out.
    pub fn send_message(&self, webhook_url: &str, content: &[u8], username: &[u8]) -> Result<()> {
        let form = message_form(content, username);
        debug!("discord message ({} bytes of content)", content.len());
        let content_type = form.content_type();
        self.queue.submit(webhook_url, &content_type, form.finish())
    }
}

fn message_form(content: &[u8], username: &[u8]) -> Multipart {
    let mut form = Multipart::new();
    form.add_text("content", &win1251_to_utf8(content))
        .add_text("username", &win1251_to_utf8(username));
    form
}
