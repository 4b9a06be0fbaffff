//! CONNACK return codes (MQTT v3.1.1 section 3.2.2.3)

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Accepted),
            1 => Some(Self::UnacceptableProtocolVersion),
            2 => Some(Self::IdentifierRejected),
            3 => Some(Self::ServerUnavailable),
            4 => Some(Self::BadUsernameOrPassword),
            5 => Some(Self::NotAuthorized),
            _ => None,
        }
    }

    /// Whether the broker refused the credentials rather than the session
    pub fn is_auth_failure(self) -> bool {
        matches!(self, Self::BadUsernameOrPassword | Self::NotAuthorized)
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Accepted => "Connection Accepted.",
            Self::UnacceptableProtocolVersion => {
                "Connection Refused: unacceptable protocol version."
            }
            Self::IdentifierRejected => "Connection Refused: identifier rejected.",
            Self::ServerUnavailable => "Connection Refused: broker unavailable.",
            Self::BadUsernameOrPassword => "Connection Refused: bad user name or password.",
            Self::NotAuthorized => "Connection Refused: not authorised.",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, false ; "accepted")]
    #[test_case(1, false ; "bad protocol")]
    #[test_case(3, false ; "unavailable")]
    #[test_case(4, true ; "bad credentials")]
    #[test_case(5, true ; "not authorized")]
    fn auth_failure_classification(code: u8, expected: bool) {
        let rc = ConnectReturnCode::from_u8(code).unwrap();
        assert_eq!(rc.is_auth_failure(), expected);
    }

    #[test]
    fn unknown_code() {
        assert!(ConnectReturnCode::from_u8(6).is_none());
    }
}
