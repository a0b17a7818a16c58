// ABOUTME: Canonical session scope builder: channel[:account[:chat[:thread]]].
// ABOUTME: Account id normalization and acct:// chat-id round-trip for multi-account adapters.

const ACCOUNT_CHAT_PREFIX: &str = "acct://";

/// Normalized account id: trimmed, lowercased; empty means `default`.
pub fn account_id_or_default(account_id: &str) -> String {
    let id = account_id.trim();
    if id.is_empty() {
        "default".to_string()
    } else {
        id.to_lowercase()
    }
}

/// Build the canonical isolation key for conversation state.
///
/// Modes: `channel`, `account`, `room` (default), `thread` (falls back to
/// room when the thread id is empty), `user` (falls back to the chat id when
/// the sender is empty). Unknown modes take the room form.
pub fn build_session_scope(
    channel: &str,
    account_id: &str,
    chat_id: &str,
    thread_id: &str,
    sender_id: &str,
    mode: &str,
) -> String {
    let ch = {
        let c = channel.trim().to_lowercase();
        if c.is_empty() {
            "channel".to_string()
        } else {
            c
        }
    };
    let account = account_id_or_default(account_id);
    let chat = chat_id.trim();
    let thread = thread_id.trim();
    let sender = sender_id.trim();

    match mode.trim().to_lowercase().as_str() {
        "channel" => ch,
        "account" => format!("{ch}:{account}"),
        "user" => {
            let who = if sender.is_empty() { chat } else { sender };
            format!("{ch}:{account}:{who}")
        }
        "thread" => {
            if thread.is_empty() {
                format!("{ch}:{account}:{chat}")
            } else {
                format!("{ch}:{account}:{chat}:{thread}")
            }
        }
        _ => format!("{ch}:{account}:{chat}"),
    }
}

/// Encode an account-scoped chat id: `acct://<id>|<chat>`; the default
/// account stays a bare chat id.
pub fn with_account_chat(account_id: &str, chat_id: &str) -> String {
    let chat = chat_id.trim();
    let id = account_id_or_default(account_id);
    if id == "default" {
        chat.to_string()
    } else {
        format!("{ACCOUNT_CHAT_PREFIX}{id}|{chat}")
    }
}

/// Decode an account-scoped chat id; anything unparseable maps back to the
/// default account with the raw value as chat id.
pub fn parse_account_chat(raw: &str) -> (String, String) {
    let raw = raw.trim();
    if !raw.to_lowercase().starts_with(ACCOUNT_CHAT_PREFIX) {
        return ("default".to_string(), raw.to_string());
    }
    let rest = &raw[ACCOUNT_CHAT_PREFIX.len()..];
    let Some((id, chat)) = rest.split_once('|') else {
        return ("default".to_string(), raw.to_string());
    };
    let chat = chat.trim();
    if chat.is_empty() {
        return ("default".to_string(), raw.to_string());
    }
    (account_id_or_default(id), chat.to_string())
}
