pub mod mock_output;
pub mod mock_packet;
pub mod mock_time;
pub mod mock_transport;
