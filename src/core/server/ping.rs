use crate::common::{Contact, ResponseBody};

use super::Server;

/// Reflects the requester's address back, along with a security token.
pub(crate) fn handle(server: &mut Server, from: &Contact) -> ResponseBody {
    ResponseBody::Pong {
        external_address: from.address(),
        token: Some(server.issue_token(from)),
    }
}
