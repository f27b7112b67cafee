use tracing::debug;

use crate::common::{
    Contact, DhtValueEntity, ResponseBody, SecurityToken, StoreStatus, StoreStatusCode,
};

use super::{RequestContext, Server};

/// Stores each entity independently and reports a status per entity, in order.
///
/// Requests without a valid security token are dropped without a response.
pub(crate) fn handle(
    server: &mut Server,
    context: RequestContext<'_>,
    from: &Contact,
    token: Option<&SecurityToken>,
    entities: &[DhtValueEntity],
) -> Option<ResponseBody> {
    let Some(token) = token else {
        debug!(?from, request_type = "store", "Missing security token");
        context.statistics.store_rejected();
        return None;
    };

    if !server.validate_token(token, from) {
        debug!(?from, request_type = "store", "Invalid security token");
        context.statistics.store_rejected();
        return None;
    }

    let statuses = entities
        .iter()
        .map(|entity| {
            let code = if context.database.store(entity.received_from(from.clone())) {
                StoreStatusCode::Ok
            } else {
                StoreStatusCode::Error
            };

            StoreStatus {
                primary_key: *entity.primary_key(),
                secondary_key: *entity.secondary_key(),
                code,
            }
        })
        .collect();

    Some(ResponseBody::Store { statuses })
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use crate::common::{
        Contact, DhtValue, DhtValueEntity, Kuid, RequestBody, ResponseBody, SecurityToken,
        StoreStatusCode, ValueType, Version,
    };
    use crate::core::database::MAX_VALUE_SIZE;
    use crate::core::server::test_util::Fixture;

    fn from() -> Contact {
        Contact::live(Kuid::random(), SocketAddr::from(([21, 75, 31, 124], 6881)), 0)
    }

    fn entity(creator: &Contact, size: usize) -> DhtValueEntity {
        let value = DhtValue::new(ValueType::BINARY, Version::default(), vec![7; size]);
        DhtValueEntity::local(creator.clone(), Kuid::random(), value)
    }

    #[test]
    fn missing_token_is_silently_dropped() {
        let mut fixture = Fixture::new();
        let from = from();

        let response = fixture.handle(
            &from,
            RequestBody::Store {
                token: None,
                entities: vec![entity(&from, 10)],
            },
        );

        assert!(response.is_none());
        assert!(fixture.database.is_empty());
        assert_eq!(fixture.statistics.store_requests_rejected(), 1);
    }

    #[test]
    fn invalid_token_is_silently_dropped() {
        let mut fixture = Fixture::new();
        let from = from();

        let response = fixture.handle(
            &from,
            RequestBody::Store {
                token: Some(SecurityToken::new(vec![1, 2, 3, 4])),
                entities: vec![entity(&from, 10)],
            },
        );

        assert!(response.is_none());
        assert!(fixture.database.is_empty());
    }

    #[test]
    fn token_of_another_address_is_rejected() {
        let mut fixture = Fixture::new();
        let from = from();
        let other = Contact::random();
        let token = fixture.server.issue_token(&other);

        let response = fixture.handle(
            &from,
            RequestBody::Store {
                token: Some(token),
                entities: vec![entity(&from, 10)],
            },
        );

        assert!(response.is_none());
        assert!(fixture.database.is_empty());
    }

    #[test]
    fn statuses_preserve_order() {
        let mut fixture = Fixture::new();
        let from = from();
        let token = fixture.server.issue_token(&from);

        let entities = vec![
            entity(&from, 10),
            entity(&from, MAX_VALUE_SIZE + 1),
            entity(&from, 20),
        ];

        let response = fixture.handle(
            &from,
            RequestBody::Store {
                token: Some(token),
                entities: entities.clone(),
            },
        );

        match response {
            Some(ResponseBody::Store { statuses }) => {
                let codes: Vec<StoreStatusCode> = statuses.iter().map(|s| s.code).collect();
                assert_eq!(
                    codes,
                    vec![
                        StoreStatusCode::Ok,
                        StoreStatusCode::Error,
                        StoreStatusCode::Ok
                    ]
                );

                for (status, entity) in statuses.iter().zip(entities.iter()) {
                    assert_eq!(&status.primary_key, entity.primary_key());
                }
            }
            other => panic!("unexpected response {:?}", other),
        }

        assert_eq!(fixture.database.value_count(), 2);

        let stored = fixture.database.values().next().cloned();
        assert!(stored.map(|e| !e.is_local() && e.is_direct()).unwrap_or(false));
    }
}
