//! Text commands to drive a [Dht] node from a console.

use std::fmt::Write;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::common::{DhtValue, EntityKey, Kuid, ValueType, Version, KUID_SIZE};
use crate::dht::Dht;
use crate::{DhtError, Result};

const HELP: &str = "\
ping <address>          ping a node
bootstrap <address>     join the network through a node
find_node <key>         find the nearest nodes to a key
find_value <key>        find the values stored under a key
put <key> <text>        store a text value under a key
remove <key>            remove the value this node stored under a key
routetable              dump the route table
database                dump the database
stats                   dump message statistics
info                    show this node's state
help                    show this help

Keys are either 40 hex digits or any text, hashed into an id.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping(SocketAddr),
    Bootstrap(SocketAddr),
    FindNode(Kuid),
    FindValue(Kuid),
    Put(Kuid, String),
    Remove(Kuid),
    RouteTable,
    Database,
    Stats,
    Info,
    Help,
}

impl Command {
    /// Runs the command on `dht`, blocking until it completes.
    pub fn execute(&self, dht: &Dht) -> Result<String> {
        let output = match self {
            Command::Ping(address) => dht.ping(*address).wait()?.to_string(),
            Command::Bootstrap(address) => dht.bootstrap(&[*address]).wait()?.to_string(),
            Command::FindNode(id) => dht.find_node(*id).wait()?.to_string(),
            Command::FindValue(key) => {
                let result = dht.find_value(EntityKey::any(*key)).wait()?;

                let mut output = result.to_string();
                for entity in result.entities() {
                    let text = String::from_utf8_lossy(entity.value().bytes());
                    let _ = write!(output, "\n{} -> {}", entity.creator().address(), text);
                }
                output
            }
            Command::Put(key, text) => {
                let value = DhtValue::new(ValueType::TEXT, Version::default(), text.clone().into_bytes());
                dht.put(*key, value).wait()?.to_string()
            }
            Command::Remove(key) => dht.remove(*key).wait()?.to_string(),
            Command::RouteTable => dht.route_table_dump()?,
            Command::Database => dht.database_dump()?,
            Command::Stats => dht.statistics_dump()?,
            Command::Info => dht.info()?.to_string(),
            Command::Help => HELP.to_string(),
        };

        Ok(output)
    }
}

impl FromStr for Command {
    type Err = DhtError;

    fn from_str(line: &str) -> Result<Command> {
        let line = line.trim();
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };

        let command = match name.to_lowercase().as_str() {
            "ping" => Command::Ping(parse_address(rest)?),
            "bootstrap" => Command::Bootstrap(parse_address(rest)?),
            "find_node" => Command::FindNode(parse_key(rest)?),
            "find_value" | "get" => Command::FindValue(parse_key(rest)?),
            "put" => {
                let (key, text) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| invalid("put needs a key and a value"))?;
                Command::Put(parse_key(key)?, text.trim().to_string())
            }
            "remove" => Command::Remove(parse_key(rest)?),
            "routetable" => Command::RouteTable,
            "database" => Command::Database,
            "stats" => Command::Stats,
            "info" => Command::Info,
            "help" | "" => Command::Help,
            other => return Err(invalid(&format!("unknown command {:?}, try help", other))),
        };

        Ok(command)
    }
}

fn parse_address(input: &str) -> Result<SocketAddr> {
    input
        .parse()
        .map_err(|_| invalid(&format!("{:?} is not an address", input)))
}

fn parse_key(input: &str) -> Result<Kuid> {
    if input.is_empty() {
        return Err(invalid("missing key"));
    }

    let is_hex_id = input.len() == KUID_SIZE * 2 && input.chars().all(|c| c.is_ascii_hexdigit());

    if is_hex_id {
        input.parse()
    } else {
        Ok(Kuid::from_key_material(input))
    }
}

fn invalid(reason: &str) -> DhtError {
    DhtError::InvalidInput(reason.to_string())
}
