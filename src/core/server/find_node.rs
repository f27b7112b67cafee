use crate::common::{Contact, Kuid, ResponseBody, RouteTable, SelectMode};

use super::Server;

/// Up to k contacts nearest to `lookup_id`, with a fresh security token.
///
/// A firewalled node never completes round trips with most peers, so it
/// answers with the contacts it heard from most recently instead.
pub(crate) fn handle(
    server: &mut Server,
    routing_table: &RouteTable,
    from: &Contact,
    lookup_id: &Kuid,
) -> ResponseBody {
    let local = routing_table.local();
    let k = routing_table.settings().k;

    let mut nodes = if local.is_firewalled() {
        routing_table
            .get_contacts()
            .into_iter()
            .filter(|c| !c.is_shutdown() && !c.is_dead())
            .take(k)
            .collect()
    } else {
        routing_table.select(lookup_id, k, SelectMode::AliveWithLocal)
    };

    if local.address().port() == 0 {
        nodes.retain(|c: &Contact| c.id() != local.id());
    }

    ResponseBody::FindNode {
        lookup_id: *lookup_id,
        token: Some(server.issue_token(from)),
        nodes,
    }
}
