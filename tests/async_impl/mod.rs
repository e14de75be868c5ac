mod consumer_flow;
mod http_registry;
#[cfg(feature = "kafka_test")]
mod kafka_round_trip;
