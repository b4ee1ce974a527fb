//! Outbound line builders for the gateway's IRC dialect.
//!
//! Inbound lines are passed through verbatim; nothing here parses them.

/// Capabilities requested right after `NICK`, in this order.
pub const CAPABILITIES: [&str; 3] = [
    "twitch.tv/membership",
    "twitch.tv/commands",
    "twitch.tv/tags",
];

/// `PASS oauth:<token>`. A token that already carries the `oauth:` prefix
/// is not prefixed twice.
pub fn pass(token: &str) -> String {
    let token = token.strip_prefix("oauth:").unwrap_or(token);
    format!("PASS oauth:{token}")
}

pub fn nick(login: &str) -> String {
    format!("NICK {login}")
}

pub fn cap_req(capability: &str) -> String {
    format!("CAP REQ :{capability}")
}

pub fn join(room: &str) -> String {
    format!("JOIN #{room}")
}

pub fn part(room: &str) -> String {
    format!("PART #{room}")
}

/// `PRIVMSG #<channel> :[@<mentionee>, ]<message>`
pub fn privmsg(channel: &str, message: &str, mentionee: Option<&str>) -> String {
    match mentionee {
        Some(who) => format!("PRIVMSG #{channel} :@{who}, {message}"),
        None => format!("PRIVMSG #{channel} :{message}"),
    }
}

/// The full handshake: PASS, NICK, then one `CAP REQ` per capability.
pub fn handshake(token: &str, login: &str) -> Vec<String> {
    let mut lines = vec![pass(token), nick(login)];
    lines.extend(CAPABILITIES.iter().map(|cap| cap_req(cap)));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privmsg_without_mention() {
        assert_eq!(privmsg("foo", "hi", None), "PRIVMSG #foo :hi");
    }

    #[test]
    fn privmsg_with_mention() {
        assert_eq!(privmsg("foo", "hi", Some("bar")), "PRIVMSG #foo :@bar, hi");
    }

    #[test]
    fn join_and_part() {
        assert_eq!(join("foo"), "JOIN #foo");
        assert_eq!(part("foo"), "PART #foo");
    }

    #[test]
    fn handshake_order() {
        let lines = handshake("secret", "botname");
        assert_eq!(
            lines,
            vec![
                "PASS oauth:secret",
                "NICK botname",
                "CAP REQ :twitch.tv/membership",
                "CAP REQ :twitch.tv/commands",
                "CAP REQ :twitch.tv/tags",
            ]
        );
    }

    #[test]
    fn pass_keeps_single_oauth_prefix() {
        assert_eq!(pass("oauth:abc"), "PASS oauth:abc");
        assert_eq!(pass("abc"), "PASS oauth:abc");
    }
}
