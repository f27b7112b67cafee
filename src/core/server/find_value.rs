use tracing::trace;

use crate::common::{Contact, DhtValueEntity, Kuid, ResponseBody, ValueType};

use super::{find_node, RequestContext, Server};

/// Values stored under `lookup_id`, or the nearest contacts if there are none.
///
/// Without requested secondary keys, a single entity is returned in full,
/// several only by their secondary keys so the requester picks what it wants.
pub(crate) fn handle(
    server: &mut Server,
    context: RequestContext<'_>,
    from: &Contact,
    lookup_id: &Kuid,
    secondary_keys: &[Kuid],
    value_type: ValueType,
) -> ResponseBody {
    let RequestContext {
        routing_table,
        database,
        ..
    } = context;

    let request_load = database.request_load(lookup_id, true);

    let Some(bag) = database.get(lookup_id) else {
        return find_node::handle(server, routing_table, from, lookup_id);
    };

    let matches = |entity: &&DhtValueEntity| value_type.matches(&entity.value().value_type());

    let (entities, keys): (Vec<DhtValueEntity>, Vec<Kuid>) = if secondary_keys.is_empty() {
        let matching: Vec<&DhtValueEntity> = bag.values().filter(matches).collect();

        if matching.len() == 1 {
            (matching.into_iter().cloned().collect(), Vec::new())
        } else {
            let keys = matching.iter().map(|e| *e.secondary_key()).collect();
            (Vec::new(), keys)
        }
    } else {
        let entities = secondary_keys
            .iter()
            .filter_map(|key| bag.get(key))
            .filter(matches)
            .cloned()
            .collect();
        (entities, Vec::new())
    };

    if entities.is_empty() && keys.is_empty() {
        trace!(?lookup_id, %value_type, "No matching values");
        return find_node::handle(server, routing_table, from, lookup_id);
    }

    ResponseBody::FindValue {
        lookup_id: *lookup_id,
        entities,
        secondary_keys: keys,
        request_load,
    }
}
