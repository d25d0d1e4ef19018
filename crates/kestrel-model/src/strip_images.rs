// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Message sanitisation: strip image content when the model does not
//! support it.
//!
//! Call [`strip_images_if_unsupported`] before building a
//! [`crate::CompletionRequest`] to ensure image blocks are replaced with a
//! text placeholder whenever the target model only supports text input.

use crate::types::{AssistantBlock, AssistantMessage, ContentBlock, Message, UserMessage};

const IMAGE_OMITTED: &str = "[image omitted: model does not support image input]";

/// Whether `model` accepts image input. Every Gemini family model is
/// multimodal except the on-device "nano" tier, which only ever shipped
/// text-in/text-out.
pub fn model_supports_images(model: &str) -> bool {
    !model.contains("nano")
}

pub fn strip_images_if_unsupported(messages: Vec<Message>, supports_images: bool) -> Vec<Message> {
    if supports_images {
        return messages;
    }
    messages.into_iter().map(strip_message).collect()
}

fn strip_message(m: Message) -> Message {
    match m {
        Message::User(u) => Message::User(strip_user(u)),
        Message::Assistant(a) => Message::Assistant(strip_assistant(a)),
        other @ Message::Progress(_) => other,
    }
}

fn strip_user(u: UserMessage) -> UserMessage {
    let content = u
        .content
        .into_iter()
        .map(|b| match b {
            ContentBlock::Image { .. } => ContentBlock::text(IMAGE_OMITTED),
            other => other,
        })
        .collect();
    UserMessage { content }
}

fn strip_assistant(a: AssistantMessage) -> AssistantMessage {
    let content = a
        .content
        .into_iter()
        .map(|b| match b {
            AssistantBlock::Image { .. } => AssistantBlock::Text { text: IMAGE_OMITTED.into() },
            other => other,
        })
        .collect();
    AssistantMessage { content, ..a }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
