use tracing::debug;

use crate::common::{ResponseBody, StatsKind};

use super::RequestContext;

/// Diagnostic dump, only for requests marked secure.
pub(crate) fn handle(
    context: RequestContext<'_>,
    kind: StatsKind,
    secure: bool,
) -> Option<ResponseBody> {
    if !secure {
        debug!(?kind, request_type = "stats", "Dropping insecure stats request");
        return None;
    }

    let statistics = match kind {
        StatsKind::Statistics => context.statistics.to_string(),
        StatsKind::Database => context.database.to_string(),
        StatsKind::RouteTable => context.routing_table.to_string(),
    };

    Some(ResponseBody::Stats { kind, statistics })
}

#[cfg(test)]
mod test {
    use crate::common::{Contact, RequestBody, ResponseBody, StatsKind};
    use crate::core::server::test_util::Fixture;

    #[test]
    fn insecure_request_is_dropped() {
        let mut fixture = Fixture::new();

        let response = fixture.handle(
            &Contact::random(),
            RequestBody::Stats {
                kind: StatsKind::RouteTable,
                secure: false,
            },
        );

        assert!(response.is_none());
    }

    #[test]
    fn database_dump() {
        let mut fixture = Fixture::new();

        let response = fixture.handle(
            &Contact::random(),
            RequestBody::Stats {
                kind: StatsKind::Database,
                secure: true,
            },
        );

        match response {
            Some(ResponseBody::Stats { kind, statistics }) => {
                assert_eq!(kind, StatsKind::Database);
                assert!(statistics.ends_with("TOTAL: 0/0"));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }
}
