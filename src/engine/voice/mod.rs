// Concierge Engine — Voice Channel
//
// Bidirectional voice over one WebSocket: streaming STT in, the
// orchestrator in the middle, streaming TTS out, with user barge-in.
//
// Module layout:
//   stt.rs     — SttBackend trait + HTTP / mock backends
//   tts.rs     — TtsBackend trait + HTTP / mock backends
//   session.rs — session state machine, reader/writer tasks, interrupts

pub mod session;
pub mod stt;
pub mod tts;

pub use session::{run_session, VoiceDeps};
pub use stt::{stt_backend, SttBackend};
pub use tts::{tts_backend, TtsBackend};
