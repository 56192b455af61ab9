//! Checks that a joining client's CONNECT is interchangeable with the one the
//! session connected to the broker with.

use crate::core::message::{Connect, ConnectReturnCode};

/// `Err` carries the CONNACK return code the client is rejected with.
pub fn validate_connect(
    original: &Connect,
    candidate: &Connect,
) -> Result<(), ConnectReturnCode> {
    if candidate.client_id != original.client_id {
        return Err(ConnectReturnCode::IdentifierRejected);
    }

    // Clustered connections share broker-side session state
    if candidate.clean_session {
        return Err(ConnectReturnCode::OTHER);
    }

    if candidate.protocol_name != original.protocol_name {
        return Err(ConnectReturnCode::OTHER);
    }

    if candidate.protocol_version != original.protocol_version {
        return Err(ConnectReturnCode::UnacceptableProtocolVersion);
    }

    if candidate.username != original.username || candidate.password != original.password {
        return Err(ConnectReturnCode::BadCredentials);
    }

    if candidate.will != original.will {
        return Err(ConnectReturnCode::OTHER);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{QoS, Will, PROTOCOL_NAME_V31};
    use bytes::Bytes;

    fn original() -> Connect {
        Connect::new("cluster", false, 30)
            .with_credentials("user", Some("secret"))
            .with_will(Will {
                topic: "status/cluster".into(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            })
    }

    #[test]
    fn test_identical_connect_is_accepted() {
        assert_eq!(validate_connect(&original(), &original()), Ok(()));
    }

    #[test]
    fn test_keep_alive_may_differ() {
        let mut candidate = original();
        candidate.keep_alive = 5;
        assert_eq!(validate_connect(&original(), &candidate), Ok(()));
    }

    #[test]
    fn test_clean_session_rejected_with_other() {
        let mut candidate = original();
        candidate.clean_session = true;
        assert_eq!(
            validate_connect(&original(), &candidate),
            Err(ConnectReturnCode::OTHER)
        );
    }

    #[test]
    fn test_protocol_mismatches() {
        let mut candidate = original();
        candidate.protocol_name = PROTOCOL_NAME_V31.into();
        assert_eq!(
            validate_connect(&original(), &candidate),
            Err(ConnectReturnCode::OTHER)
        );

        let mut candidate = original();
        candidate.protocol_version = 3;
        assert_eq!(
            validate_connect(&original(), &candidate),
            Err(ConnectReturnCode::UnacceptableProtocolVersion)
        );
    }

    #[test]
    fn test_credential_mismatches() {
        let mut candidate = original();
        candidate.password = Some("wrong".into());
        assert_eq!(
            validate_connect(&original(), &candidate),
            Err(ConnectReturnCode::BadCredentials)
        );

        let mut candidate = original();
        candidate.username = None;
        candidate.password = None;
        assert_eq!(
            validate_connect(&original(), &candidate),
            Err(ConnectReturnCode::BadCredentials)
        );
    }

    #[test]
    fn test_will_mismatches() {
        let mutations: [fn(&mut Will); 4] = [
            |will| will.topic = "status/other".into(),
            |will| will.payload = Bytes::from_static(b"gone"),
            |will| will.qos = QoS::AtMostOnce,
            |will| will.retain = false,
        ];
        for mutate in mutations {
            let mut candidate = original();
            if let Some(will) = candidate.will.as_mut() {
                mutate(will);
            }
            assert_eq!(
                validate_connect(&original(), &candidate),
                Err(ConnectReturnCode::OTHER)
            );
        }

        let mut candidate = original();
        candidate.will = None;
        assert_eq!(
            validate_connect(&original(), &candidate),
            Err(ConnectReturnCode::OTHER)
        );
    }

    #[test]
    fn test_client_id_mismatch() {
        let mut candidate = original();
        candidate.client_id = "someone-else".into();
        assert_eq!(
            validate_connect(&original(), &candidate),
            Err(ConnectReturnCode::IdentifierRejected)
        );
    }
}
