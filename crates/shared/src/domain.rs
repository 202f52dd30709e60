use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(SessionId);
id_newtype!(ClientMessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum SessionKind {
    Direct,
    Channel,
}

impl TryFrom<i32> for SessionKind {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SessionKind::Direct),
            2 => Ok(SessionKind::Channel),
            other => Err(format!("unknown session kind code {other}")),
        }
    }
}

impl From<SessionKind> for i32 {
    fn from(value: SessionKind) -> Self {
        match value {
            SessionKind::Direct => 1,
            SessionKind::Channel => 2,
        }
    }
}

impl SessionId {
    /// Derives the conversation id shared by both participants.
    ///
    /// Direct conversations use the two participant ids sorted ascending and
    /// joined with `_`, so either peer computes the same id without
    /// coordination. Channel conversations are identified by the channel id
    /// itself.
    pub fn derive(kind: SessionKind, local: &UserId, peer: &UserId) -> SessionId {
        match kind {
            SessionKind::Channel => SessionId(peer.0.clone()),
            SessionKind::Direct => {
                let (lo, hi) = if local.0 <= peer.0 {
                    (&local.0, &peer.0)
                } else {
                    (&peer.0, &local.0)
                };
                SessionId(format!("{lo}_{hi}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_session_id_is_symmetric() {
        let a = UserId::from("1");
        let b = UserId::from("2");
        let from_a = SessionId::derive(SessionKind::Direct, &a, &b);
        let from_b = SessionId::derive(SessionKind::Direct, &b, &a);
        assert_eq!(from_a, from_b);
        assert_eq!(from_a.as_str(), "1_2");
    }

    #[test]
    fn channel_session_id_is_the_channel_id() {
        let me = UserId::from("42");
        let channel = UserId::from("town-square");
        let sid = SessionId::derive(SessionKind::Channel, &me, &channel);
        assert_eq!(sid.as_str(), "town-square");
    }

    #[test]
    fn session_kind_rejects_unknown_codes() {
        assert!(SessionKind::try_from(1).is_ok());
        assert!(SessionKind::try_from(2).is_ok());
        assert!(SessionKind::try_from(9).is_err());
    }
}
