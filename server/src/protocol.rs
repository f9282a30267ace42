pub const MAX_KV: usize = 32;
pub const MAX_KEY: usize = 32;
pub const MAX_VAL: usize = 128;
pub const MAX_CMD: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoType {
    Req,
    Resp,
    Evt,
    Err,
}

impl ProtoType {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "REQ" => Some(ProtoType::Req),
            "RESP" => Some(ProtoType::Resp),
            "EVT" => Some(ProtoType::Evt),
            "ERR" => Some(ProtoType::Err),
            _ => None,
        }
    }
}

/// One parsed protocol line: `TYPE CMD [key=value ...]`.
#[derive(Clone, Debug)]
pub struct ProtoMsg {
    pub msg_type: ProtoType,
    pub cmd: String,
    kv: Vec<(String, String)>,
}

/// Clips a string to at most `max` bytes without splitting a character.
pub(crate) fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl ProtoMsg {
    /// Parses one line. Fails when the type or command token is absent or the
    /// type is unknown. Oversized values are truncated, not rejected; keys of
    /// length 0 or above the cap are dropped, as are pairs past the pair cap.
    pub fn parse(line: &str) -> Option<ProtoMsg> {
        let mut tokens = line.split_ascii_whitespace();
        let msg_type = ProtoType::from_token(tokens.next()?)?;
        let cmd = clip(tokens.next()?, MAX_CMD - 1).to_string();

        let mut kv = Vec::new();
        for token in tokens {
            if kv.len() >= MAX_KV {
                break;
            }
            let Some((key, val)) = token.split_once('=') else {
                continue;
            };
            if key.is_empty() || key.len() >= MAX_KEY {
                continue;
            }
            kv.push((key.to_string(), clip(val, MAX_VAL - 1).to_string()));
        }

        Some(ProtoMsg { msg_type, cmd, kv })
    }

    /// Value of the first pair with the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.kv
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_type_and_cmd() {
        let m = ProtoMsg::parse("REQ LOGIN nick=alice").unwrap();
        assert_eq!(m.msg_type, ProtoType::Req);
        assert_eq!(m.cmd, "LOGIN");
        assert_eq!(m.get("nick"), Some("alice"));
    }

    #[test]
    fn all_types_parse() {
        for (token, expected) in [
            ("REQ", ProtoType::Req),
            ("RESP", ProtoType::Resp),
            ("EVT", ProtoType::Evt),
            ("ERR", ProtoType::Err),
        ] {
            let m = ProtoMsg::parse(&format!("{token} X")).unwrap();
            assert_eq!(m.msg_type, expected);
        }
    }

    #[test]
    fn line_without_pairs_is_valid() {
        let m = ProtoMsg::parse("REQ LIST_ROOMS").unwrap();
        assert_eq!(m.cmd, "LIST_ROOMS");
        assert_eq!(m.get("anything"), None);
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(ProtoMsg::parse("NOPE LOGIN").is_none());
    }

    #[test]
    fn rejects_missing_tokens() {
        assert!(ProtoMsg::parse("").is_none());
        assert!(ProtoMsg::parse("   ").is_none());
        assert!(ProtoMsg::parse("REQ").is_none());
    }

    #[test]
    fn value_round_trip() {
        let key = "k";
        let val = "some=value-with=equals";
        let m = ProtoMsg::parse(&format!("REQ X {key}={val}")).unwrap();
        assert_eq!(m.get(key), Some(val));
    }

    #[test]
    fn first_match_wins() {
        let m = ProtoMsg::parse("REQ X a=1 a=2").unwrap();
        assert_eq!(m.get("a"), Some("1"));
    }

    #[test]
    fn tokens_without_equals_are_skipped() {
        let m = ProtoMsg::parse("REQ X junk a=1").unwrap();
        assert_eq!(m.get("a"), Some("1"));
        assert_eq!(m.get("junk"), None);
    }

    #[test]
    fn empty_or_oversized_keys_are_dropped() {
        let m = ProtoMsg::parse("REQ X =v a=1").unwrap();
        assert_eq!(m.get(""), None);
        assert_eq!(m.get("a"), Some("1"));

        let long_key = "k".repeat(32);
        let m = ProtoMsg::parse(&format!("REQ X {long_key}=v a=1")).unwrap();
        assert_eq!(m.get(&long_key), None);
        assert_eq!(m.get("a"), Some("1"));

        let max_key = "k".repeat(31);
        let m = ProtoMsg::parse(&format!("REQ X {max_key}=v")).unwrap();
        assert_eq!(m.get(&max_key), Some("v"));
    }

    #[test]
    fn oversized_values_are_truncated() {
        let long_val = "v".repeat(200);
        let m = ProtoMsg::parse(&format!("REQ X a={long_val}")).unwrap();
        assert_eq!(m.get("a").map(|v| v.len()), Some(127));
    }

    #[test]
    fn oversized_cmd_is_truncated() {
        let long_cmd = "C".repeat(40);
        let m = ProtoMsg::parse(&format!("REQ {long_cmd}")).unwrap();
        assert_eq!(m.cmd.len(), 31);
    }

    #[test]
    fn pairs_past_cap_are_dropped() {
        let mut line = String::from("REQ X");
        for i in 0..40 {
            line.push_str(&format!(" k{i}={i}"));
        }
        let m = ProtoMsg::parse(&line).unwrap();
        assert_eq!(m.get("k31"), Some("31"));
        assert_eq!(m.get("k32"), None);
    }
}
