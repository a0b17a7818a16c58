// ABOUTME: Fixed user-facing pairing message templates.

/// Confirmation sent back to a sender after an operator approves them.
pub const PAIRING_APPROVED_MESSAGE: &str =
    "Pairing approved. You can now send messages to KafClaw.";

/// Reply sent to an unknown sender embedding their one-time pairing code and
/// the operator command that approves it.
pub fn build_pairing_reply(channel: &str, sender_label: &str, code: &str) -> String {
    format!(
        "KafClaw: access not configured.\n\n{sender_label}\n\nPairing code: {code}\n\nAsk the bot owner to approve with:\n`kafclaw pairing approve {channel} {code}`"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_embeds_code_and_approval_command() {
        let reply = build_pairing_reply("slack", "Sender: U1", "ABCD2345");
        assert!(reply.starts_with("KafClaw: access not configured.\n\n"));
        assert!(reply.contains("Sender: U1"));
        assert!(reply.contains("Pairing code: ABCD2345"));
        assert!(reply.contains("`kafclaw pairing approve slack ABCD2345`"));
    }
}
