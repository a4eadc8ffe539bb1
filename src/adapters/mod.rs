pub mod influx;
pub mod mqtt;
pub use influx::InfluxRepository;
pub use mqtt::MqttAdapter;
