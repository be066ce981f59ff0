use std::ops::Range;
use std::sync::Arc;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageEntityKind, MessageEntityRef, User};
use tracing::{debug, info, warn};

use super::truncate;
use crate::bus::{Bus, PublishOutcome};
use crate::config::TelegramConfig;
use crate::message::{
    self, Attachment, AuthorInfo, Endpoint, MentionKind, PlatformId, Reply, Segment,
};

/// Platform tag for Telegram chats on the bus
pub const PLATFORM: &str = "telegram";

/// Telegram's hard limit on message length
const MAX_MESSAGE_LEN: usize = 4096;
/// How much of a replied-to message to quote
const REPLY_PREVIEW_LEN: usize = 80;

struct TelegramState {
    bus: Bus,
    admin_user_ids: Vec<u64>,
}

/// Link administration commands understood in any chat.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Start,
    Link { target: String, bidirectional: bool },
    Unlink { target: String, bidirectional: bool },
    Links,
}

impl Command {
    /// Returns None for ordinary messages and unknown commands, which are
    /// relayed like any other text.
    fn parse(text: &str) -> Option<Self> {
        let mut words = text.split_whitespace();
        let head = words.next()?.strip_prefix('/')?;
        // group chats address commands as /link@SomeBot
        let name = head.split('@').next().unwrap_or(head);
        let target = words.next().map(str::to_string);
        let bidirectional = !matches!(words.next(), Some("oneway"));

        match (name, target) {
            ("start", _) => Some(Command::Start),
            ("links", _) => Some(Command::Links),
            ("link", Some(target)) => Some(Command::Link {
                target,
                bidirectional,
            }),
            ("unlink", Some(target)) => Some(Command::Unlink {
                target,
                bidirectional,
            }),
            _ => None,
        }
    }

    fn requires_admin(&self) -> bool {
        matches!(self, Command::Link { .. } | Command::Unlink { .. })
    }
}

fn author_from(user: &User) -> AuthorInfo {
    AuthorInfo {
        name: user.first_name.clone(),
        id: PlatformId::from(user.id.0.to_string()),
        avatar_url: None,
        deprioritize: user.is_bot,
    }
}

/// A user mention in message text, as a byte range into that text
#[derive(Debug, Clone, PartialEq)]
struct MentionSpan {
    range: Range<usize>,
    name: String,
    id: PlatformId,
}

fn mention_spans(entities: &[MessageEntityRef<'_>]) -> Vec<MentionSpan> {
    entities
        .iter()
        .filter_map(|entity| match entity.kind() {
            // @username; no numeric id is known, so the username stands in
            MessageEntityKind::Mention => {
                let name = entity.text().trim_start_matches('@');
                Some(MentionSpan {
                    range: entity.range(),
                    name: name.to_string(),
                    id: PlatformId::from(name),
                })
            }
            // users without a username, linked by id
            MessageEntityKind::TextMention { user } => Some(MentionSpan {
                range: entity.range(),
                name: user.first_name.clone(),
                id: PlatformId::from(user.id.0.to_string()),
            }),
            _ => None,
        })
        .collect()
}

/// Split `text` into text and mention segments. A leading `/me ` marks an
/// action and is not part of the body. Spans that overlap or fall outside
/// the text are left as plain text.
fn body_segments(text: &str, mut mentions: Vec<MentionSpan>) -> (Vec<Segment>, bool) {
    let (offset, action) = match text.strip_prefix("/me ") {
        Some(_) => ("/me ".len(), true),
        None => (0, false),
    };
    let text = &text[offset..];
    mentions.sort_by_key(|mention| mention.range.start);

    let mut segments = Vec::new();
    let mut cursor = 0;
    for mention in mentions {
        if mention.range.start < offset + cursor {
            continue;
        }
        let range = mention.range.start - offset..mention.range.end - offset;
        let (Some(before), Some(_)) = (text.get(cursor..range.start), text.get(range.clone()))
        else {
            continue;
        };
        if !before.is_empty() {
            segments.push(Segment::text(before));
        }
        segments.push(Segment::mention(MentionKind::User, mention.name, mention.id));
        cursor = range.end;
    }
    let rest = &text[cursor..];
    if !rest.is_empty() || segments.is_empty() {
        segments.push(Segment::text(rest));
    }
    (segments, action)
}

/// Text or caption of a message, split into segments.
fn segments_of(msg: &Message) -> Option<(Vec<Segment>, bool)> {
    let (text, entities) = match (msg.text(), msg.caption()) {
        (Some(text), _) => (text, msg.parse_entities()),
        (None, Some(caption)) => (caption, msg.parse_caption_entities()),
        (None, None) => return None,
    };
    let mentions = entities.as_deref().map(mention_spans).unwrap_or_default();
    Some(body_segments(text, mentions))
}

/// Name for a file carried by the message, if it carries one.
fn attachment_name(msg: &Message) -> Option<String> {
    if let Some(document) = msg.document() {
        return Some(document.file_name.clone().unwrap_or_else(|| "document".to_string()));
    }
    if let Some(video) = msg.video() {
        return Some(video.file_name.clone().unwrap_or_else(|| "video.mp4".to_string()));
    }
    if let Some(audio) = msg.audio() {
        return Some(audio.file_name.clone().unwrap_or_else(|| "audio".to_string()));
    }
    msg.photo().map(|_| "photo.jpg".to_string())
}

/// Attachments are passed on as links to the Telegram message. Chats without
/// public links (private groups) cannot share a file URL without leaking the
/// bot token, so the file is named in the text instead.
fn attach(name: Option<String>, link: Option<String>, body: &mut Vec<Segment>) -> Vec<Attachment> {
    match (name, link) {
        (Some(filename), Some(url)) => vec![Attachment { filename, url }],
        (Some(filename), None) => {
            if matches!(body.as_slice(), [Segment::Text { text }] if text.is_empty()) {
                body.clear();
            } else {
                body.push(Segment::text(" "));
            }
            body.push(Segment::text(format!("[{}]", filename)));
            Vec::new()
        }
        (None, _) => Vec::new(),
    }
}

/// Convert an incoming Telegram message into a bus message. Returns None for
/// messages with neither text, caption nor file.
fn to_bus_message(msg: &Message, user: &User) -> Option<message::Message> {
    let name = attachment_name(msg);
    let (mut body, action) = match segments_of(msg) {
        Some(parts) => parts,
        None if name.is_some() => (vec![Segment::text("")], false),
        None => return None,
    };
    let attachments = attach(name, msg.url().map(|url| url.to_string()), &mut body);

    let reply = match msg.reply_to_message() {
        None => Reply::None,
        Some(original) => match (original.from.as_ref(), segments_of(original)) {
            (Some(author), Some((body, _))) => Reply::Resolved {
                author: author_from(author),
                body,
            },
            _ => Reply::Unresolved,
        },
    };

    Some(
        message::Message::new(
            author_from(user),
            body,
            Endpoint::new(PLATFORM, msg.chat.id.0),
            msg.id.0,
        )
        .with_attachments(attachments)
        .with_action(action)
        .with_reply(reply),
    )
}

/// Render a bridged message as a single Telegram text message.
fn render(msg: &message::Message) -> String {
    let mut out = String::new();
    match &msg.reply {
        Reply::None => {}
        Reply::Unresolved => out.push_str("↪ (reply to an unknown message)\n"),
        Reply::Resolved { author, body } => {
            let quoted = truncate(&message::render_plain(body), REPLY_PREVIEW_LEN);
            out.push_str(&format!("↪ {}: {}\n", author.name, quoted));
        }
    }

    let body = message::render_plain(&msg.body);
    if msg.action {
        out.push_str(&format!("* {} {}", msg.author.name, body));
    } else {
        out.push_str(&format!("<{}> {}", msg.author.name, body));
    }

    for attachment in &msg.attachments {
        out.push_str(&format!("\n📎 {}: {}", attachment.filename, attachment.url));
    }

    truncate(&out, MAX_MESSAGE_LEN)
}

/// Deliver a bridged message into a Telegram chat
async fn deliver(bot: &Bot, channel: PlatformId, msg: &message::Message) -> Result<()> {
    let Some(chat_id) = channel.as_int() else {
        warn!("Telegram chat id must be numeric, got {}", channel);
        return Ok(());
    };
    bot.send_message(ChatId(chat_id), render(msg)).await?;
    Ok(())
}

/// Run the Telegram adapter: relay chat messages onto the bus, deliver bus
/// messages addressed to Telegram chats, and serve the link commands.
pub async fn run(bus: Bus, config: TelegramConfig) -> Result<()> {
    let bot = Bot::new(&config.bot_token);

    info!("Starting Telegram platform...");

    let outbound = bot.clone();
    bus.add_listener(PLATFORM, move |channel, msg| {
        let bot = outbound.clone();
        async move { deliver(&bot, channel, &msg).await }
    });

    let state = Arc::new(TelegramState {
        bus,
        admin_user_ids: config.admin_user_ids,
    });

    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<TelegramState>) -> ResponseResult<()> {
    let user = match msg.from.as_ref() {
        Some(user) => user,
        None => return Ok(()),
    };

    if let Some(command) = msg.text().and_then(Command::parse) {
        let reply = run_command(&state, &msg, user, command).await;
        bot.send_message(msg.chat.id, reply).await?;
        return Ok(());
    }

    let Some(bus_message) = to_bus_message(&msg, user) else {
        debug!("Ignoring Telegram message {} with nothing to relay", msg.id.0);
        return Ok(());
    };

    match state.bus.publish(bus_message) {
        PublishOutcome::Dropped => {
            debug!("Chat {} is sending faster than the bridge allows", msg.chat.id.0)
        }
        outcome => debug!("Telegram message {} in {}: {:?}", msg.id.0, msg.chat.id.0, outcome),
    }

    Ok(())
}

async fn run_command(state: &TelegramState, msg: &Message, user: &User, command: Command) -> String {
    if command.requires_admin() && !state.admin_user_ids.contains(&user.id.0) {
        return "You are not allowed to change bridge links.".to_string();
    }

    let here = Endpoint::new(PLATFORM, msg.chat.id.0);
    match command {
        Command::Start => format!(
            "This chat is {}.\n\n\
             Commands:\n\
             /link <platform:channel> [oneway] - relay messages to another chat\n\
             /unlink <platform:channel> [oneway] - stop relaying\n\
             /links - list chats reachable from here",
            here
        ),
        Command::Links => {
            let reachable = state.bus.reachable_from(&here);
            if reachable.is_empty() {
                return "This chat is not bridged anywhere.".to_string();
            }
            let mut out = String::from("Messages from here reach:\n");
            for endpoint in reachable {
                out.push_str(&format!("  - {}\n", endpoint));
            }
            out
        }
        Command::Link {
            target,
            bidirectional,
        } => {
            let target: Endpoint = match target.parse() {
                Ok(t) => t,
                Err(e) => return format!("Error: {}", e),
            };
            let cause = format!("telegram user {}", user.id.0);
            match state
                .bus
                .add_bridge_link(&here, &target, Some(&cause), bidirectional)
                .await
            {
                Ok(()) => format!("Bridged {} and {}.", here, target),
                Err(e) => format!("Error: {}", e),
            }
        }
        Command::Unlink {
            target,
            bidirectional,
        } => {
            let target: Endpoint = match target.parse() {
                Ok(t) => t,
                Err(e) => return format!("Error: {}", e),
            };
            match state
                .bus
                .remove_bridge_link(&here, &target, bidirectional)
                .await
            {
                Ok(()) => format!("Unbridged {} and {}.", here, target),
                Err(e) => format!("Error: {}", e),
            }
        }
    }
}
