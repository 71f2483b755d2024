//! Wires a two-stage filter chain onto the dispatch engine, issues one
//! packet decorated with a CLI-supplied integer, and prints the resulting
//! decorations as JSON.

use autoflow_engine::{AutoPacketFactory, FilterDescriptor, FilterInput, TypeKey};
use clap::Parser;
use serde::Serialize;

/// Wire a small filter chain and dispatch one packet through it.
#[derive(Parser, Debug)]
#[command(name = "autoflow-cli", about = "Wire a small filter chain and dispatch one packet")]
struct Args {
    /// Integer input used to decorate the packet
    #[arg(long, default_value_t = 21)]
    value: i64,
}

#[derive(Clone, Copy)]
struct Doubled(i64);

#[derive(Serialize)]
struct Summary {
    input: i64,
    doubled: i64,
    rendered: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let factory = AutoPacketFactory::new();
    factory
        .add_subscriber(FilterDescriptor::new(
            "double",
            vec![
                FilterInput::required(TypeKey::of::<i64>()),
                FilterInput::out_ref(TypeKey::of::<Doubled>()),
            ],
            false,
            |packet| {
                let n = packet.get::<i64>().expect("required input present when invoked");
                packet.decorate(Doubled(*n * 2)).expect("`double` is the sole publisher of Doubled");
            },
        ))
        .expect("no output clash registering `double`");

    factory
        .add_subscriber(FilterDescriptor::new(
            "render",
            vec![
                FilterInput::required(TypeKey::of::<Doubled>()),
                FilterInput::out_ref(TypeKey::of::<String>()),
            ],
            false,
            |packet| {
                let doubled = packet.get::<Doubled>().expect("required input present when invoked");
                packet
                    .decorate(format!("{}", doubled.0))
                    .expect("`render` is the sole publisher of String");
            },
        ))
        .expect("no output clash registering `render`");

    factory.start().expect("factory starts from Unstarted");
    let packet = factory.new_packet().expect("factory is running");
    packet.decorate(args.value).expect("`main` is the sole publisher of i64");

    let summary = Summary {
        input: args.value,
        doubled: packet.get::<Doubled>().map(|d| d.0).unwrap_or_default(),
        rendered: packet.get::<String>().map(|s| (*s).clone()).unwrap_or_default(),
    };
    factory.stop(true);

    let json = serde_json::to_string(&summary).expect("Summary is always serializable");
    println!("{json}");
}
