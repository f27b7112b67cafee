//! Stores a value, then watches store-forward copy it to a node joining
//! next to its key.
//!
//! Run: `cargo run --example store_forward`

use std::thread;
use std::time::{Duration, Instant};

use kadmium::{Dht, DhtValue, EntityKey, Kuid, Testnet, ValueType, Version};
use tracing::Level;

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let testnet = Testnet::new(30).expect("testnet failed to start");

    let key = Kuid::from_key_material("store forward");
    let value = DhtValue::new(ValueType::TEXT, Version::new(1, 0), &b"replicated"[..]);

    let stored = testnet.nodes[0]
        .put(key, value)
        .wait()
        .expect("put failed");
    println!("\nStored at {} nodes\n", stored.locations().len());

    // An id next to the key puts the newcomer in the key's replica set.
    let newcomer = Dht::builder()
        .config(Testnet::config())
        .node_id(key.flip_bit(kadmium::common::KUID_BITS - 1))
        .network(&testnet.network)
        .build()
        .expect("failed to start newcomer");

    let bootstrap = newcomer
        .bootstrap(testnet.bootstrap())
        .wait()
        .expect("bootstrap failed");
    println!("Newcomer bootstrapped: {}\n", bootstrap);

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(10) {
        let info = newcomer.info().expect("node was shutdown");

        if info.values() > 0 {
            println!(
                "Newcomer received the value after {:?}\n{}",
                start.elapsed(),
                newcomer.database_dump().expect("node was shutdown")
            );
            break;
        }

        thread::sleep(Duration::from_millis(50));
    }

    let found = newcomer
        .find_value(EntityKey::any(key))
        .wait()
        .expect("find_value failed");
    println!("\n{}", found);
}
