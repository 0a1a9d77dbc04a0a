/*!
# Symbion DevKit - test doubles for the throttling controller

Lets the consumer pool and control loop run without a broker or a GPU:
- `MockStreamClient`: scripted stream client with a call log
- `ScriptedSampler`: sampler replaying a fixed sequence of probe results
- `RecordingSink`: message sink that keeps everything it receives
- `TestHarness`: a pool of mock consumers plus a control loop builder
- `FakeBroker`: local MQTT endpoint for exercising the real client
*/

pub mod builders;
pub mod fake_broker;
pub mod mock_stream;
pub mod recording_sink;
pub mod scripted_sampler;
pub mod test_utils;

pub use builders::{job_message, reading, JobMessageBuilder};
pub use fake_broker::{BrokerPacket, FakeBroker};
pub use mock_stream::{MockStreamClient, MockStreamController, StreamCall};
pub use recording_sink::RecordingSink;
pub use scripted_sampler::ScriptedSampler;
pub use test_utils::{wait_until, TestHarness, TEST_TOPIC};
