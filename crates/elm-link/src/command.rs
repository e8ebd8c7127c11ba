//! AT/OBD command engine
//!
//! One exchange: clear stale input, write the command line, read until the
//! prompt. Validation and retry sit on top of that.

use crate::framing::{CARRIAGE_RETURN, COMMAND_TERMINATOR, FRAME_DELIMITER, PROMPT, SEARCHING};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Segment the adapter prints when a command was accepted
const OK_MARKER: &str = "OK";

/// Segments that mark a failed exchange
const ERROR_MARKERS: &[&str] = &[
    "?",
    "ERROR",
    "UNABLE TO CONNECT",
    "NO DATA",
    "STOPPED",
    "BUFFER FULL",
    "CAN ERROR",
    "BUS ERROR",
    "BUS BUSY",
];

fn segments(response: &str) -> impl Iterator<Item = &str> {
    response
        .split(FRAME_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Does any delimited segment read exactly `OK`?
pub fn has_ok_marker(response: &str) -> bool {
    segments(response).any(|s| s == OK_MARKER)
}

/// Does any delimited segment carry an adapter error marker?
pub fn has_error_marker(response: &str) -> bool {
    segments(response).any(|s| {
        ERROR_MARKERS
            .iter()
            .any(|marker| if *marker == "?" { s == "?" } else { s.contains(marker) })
    })
}

/// Validate a raw response against the request that produced it.
///
/// Fails when the response is empty after trimming. Otherwise an explicit
/// `OK` segment passes; failing that the response must be at least as long
/// as the request, start with the echoed request, and carry no error marker.
pub fn validate_response(request: &str, response: &str) -> bool {
    let trimmed = response.trim_matches(|c: char| c == FRAME_DELIMITER || c.is_whitespace());
    if trimmed.is_empty() {
        return false;
    }
    if has_ok_marker(response) {
        return true;
    }
    if response.len() < request.len() || !response.starts_with(request) {
        return false;
    }
    !has_error_marker(response)
}

/// Serializes AT/OBD exchanges over a [`Transport`]
pub struct CommandEngine {
    transport: Arc<Transport>,
    in_flight: Mutex<()>,
}

impl CommandEngine {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            in_flight: Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// One exchange, unvalidated.
    ///
    /// If the adapter reports it is searching for a protocol, one more
    /// bounded read is made and the marker is stripped.
    pub async fn send(&self, command: &str) -> String {
        let _exchange = self.in_flight.lock().await;
        self.exchange(command).await
    }

    async fn exchange(&self, command: &str) -> String {
        let config = self.transport.config();
        let stale = self.transport.drain_available().await;
        if !stale.is_empty() {
            debug!(command, stale = %stale, "Discarded input before command");
        }

        let line = format!("{command}{COMMAND_TERMINATOR}");
        if !self.transport.write_raw(line.as_bytes()).await {
            return String::new();
        }
        self.transport.stats_handle().command_sent();

        let mut response = self
            .transport
            .read_until(PROMPT, config.command_wait())
            .await;
        if response.contains(SEARCHING) {
            let rest = self
                .transport
                .read_until(PROMPT, config.search_wait())
                .await;
            response.push_str(&rest);
            response = strip_searching(&response);
        }
        debug!(command, response = %response, "Adapter exchange");
        response
    }

    /// Repeat `send` until a response validates or the deadline passes.
    ///
    /// Returns the validated response, or an empty string.
    pub async fn send_with_retry(&self, command: &str) -> String {
        let config = self.transport.config();
        let stop = self.transport.stop_signal();
        let deadline = Instant::now() + config.retry_deadline();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let response = self.send(command).await;
            if validate_response(command, &response) {
                return response;
            }
            self.transport.stats_handle().validation_failed();
            debug!(command, attempts, response = %response, "Response failed validation");

            if Instant::now() + config.retry_interval() >= deadline {
                break;
            }
            if !stop.sleep(config.retry_interval()).await {
                break;
            }
        }
        warn!(command, attempts, "Command got no valid response before deadline");
        String::new()
    }

    /// Send `commands` in order through `send_with_retry`, stopping at the
    /// first failure.
    pub async fn send_init_sequence<S: AsRef<str>>(&self, commands: &[S]) -> bool {
        for command in commands {
            let command = command.as_ref();
            if self.send_with_retry(command).await.is_empty() {
                warn!(command, "Init sequence aborted");
                return false;
            }
        }
        true
    }
}

impl CommandEngine {
    /// Issue a command whose reply is an open-ended line stream (`ATMA`)
    /// and return the first line, normally the echo.
    pub async fn start_stream(&self, command: &str, max_wait: Duration) -> String {
        let _exchange = self.in_flight.lock().await;
        self.transport.drain_available().await;

        let line = format!("{command}{COMMAND_TERMINATOR}");
        if !self.transport.write_raw(line.as_bytes()).await {
            return String::new();
        }
        self.transport.stats_handle().command_sent();
        let echo = self.read_stream_line(max_wait).await;
        debug!(command, echo = %echo, "Stream started");
        echo
    }

    /// Next line of a running stream, or empty on timeout.
    pub async fn next_line(&self, max_wait: Duration) -> String {
        let _exchange = self.in_flight.lock().await;
        self.read_stream_line(max_wait).await
    }

    /// Interrupt a running stream and collect everything up to the prompt.
    ///
    /// Any byte stops the adapter; a bare terminator is also harmless when
    /// no stream is running.
    pub async fn stop_stream(&self) -> String {
        let _exchange = self.in_flight.lock().await;
        if !self.transport.write_raw(COMMAND_TERMINATOR.as_bytes()).await {
            return String::new();
        }
        let tail = self
            .transport
            .read_until(PROMPT, self.transport.config().command_wait())
            .await;
        debug!(tail = %tail, "Stream stopped");
        tail
    }

    async fn read_stream_line(&self, max_wait: Duration) -> String {
        let line = self.transport.read_until(CARRIAGE_RETURN, max_wait).await;
        line.trim_matches(|c: char| c == FRAME_DELIMITER || c.is_whitespace())
            .to_string()
    }
}

/// Remove the searching marker and the empty segment it leaves behind
fn strip_searching(response: &str) -> String {
    let mut out = String::with_capacity(response.len());
    for segment in response.split(FRAME_DELIMITER) {
        let cleaned = segment.replace(SEARCHING, "");
        if cleaned.trim().is_empty() {
            continue;
        }
        out.push_str(&cleaned);
        out.push(FRAME_DELIMITER);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::mock::{MockAdapter, MockConnector, MockReply};
    use std::time::Duration;

    async fn engine_for(adapter: MockAdapter) -> CommandEngine {
        let connector = MockConnector::new(adapter);
        let transport = Arc::new(Transport::new(Arc::new(connector), LinkConfig::fast()));
        assert!(transport.open("mock://elm").await);
        CommandEngine::new(transport)
    }

    #[test]
    fn test_validation_rules() {
        assert!(validate_response("010C", "010C|7E8 04 41 0C 1A F8 |"));
        assert!(validate_response("ATE1", "ATE1|OK|"));
        assert!(validate_response("ATSP6", "OK|"));
        assert!(!validate_response("010C", "41 0C|"));
        assert!(!validate_response("010C", "010C|NO DATA|"));
        assert!(!validate_response("ATXX", "ATXX|?|"));
        assert!(!validate_response("ATWS", "GARBAGE"));
        assert!(!validate_response("ATWS", "|  |"));
        assert!(!validate_response("ATWS", "ATW"));
    }

    #[test]
    fn test_markers_match_whole_segments() {
        assert!(has_ok_marker("ATL0|OK|"));
        assert!(!has_ok_marker("ATL0|BROKEN|"));
        assert!(has_error_marker("0100|UNABLE TO CONNECT|"));
        assert!(!has_error_marker("0100|7E8 06 41 00 BE 3F A8 13|"));
    }

    #[test]
    fn test_strip_searching() {
        assert_eq!(
            strip_searching("0100|SEARCHING...|7E8 06 41 00 BE 3F A8 13 |"),
            "0100|7E8 06 41 00 BE 3F A8 13 |"
        );
    }

    #[tokio::test]
    async fn test_send_returns_raw_response() {
        let engine = engine_for(MockAdapter::echoing()).await;
        assert_eq!(engine.send("ATRV").await, "ATRV|12.6V|");
    }

    #[tokio::test]
    async fn test_send_waits_out_protocol_search() {
        let adapter = MockAdapter::new(|command| match command {
            "0100" => MockReply::Text(
                "0100\rSEARCHING...\r7E8 06 41 00 BE 3F A8 13 \r\r>".to_string(),
            ),
            other => crate::mock::elm327_reply(other),
        });
        let engine = engine_for(adapter).await;
        let response = engine.send("0100").await;
        assert!(!response.contains("SEARCHING"));
        assert!(response.starts_with("0100|7E8 06 41 00"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_on_garbage() {
        let adapter = MockAdapter::fixed("GARBAGE\r\r>");
        let engine = engine_for(adapter.clone()).await;

        let started = Instant::now();
        let response = engine.send_with_retry("ATWS").await;

        assert_eq!(response, "");
        assert!(adapter.count("ATWS") > 1);
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert!(started.elapsed() <= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_retry_returns_first_valid_response() {
        let engine = engine_for(MockAdapter::echoing()).await;
        assert_eq!(engine.send_with_retry("ATE1").await, "ATE1|OK|");
    }

    #[tokio::test]
    async fn test_stream_lines_and_stop() {
        let adapter = MockAdapter::echoing();
        let engine = engine_for(adapter.clone()).await;

        let echo = engine.start_stream("ATMA", Duration::from_secs(1)).await;
        assert_eq!(echo, "ATMA");
        assert_eq!(engine.next_line(Duration::from_secs(1)).await, "7E8 04 41 0C 1A F8");
        assert_eq!(
            engine.next_line(Duration::from_secs(1)).await,
            "3E9 00 3F 12 A0 00 00 00 00"
        );

        let tail = engine.stop_stream().await;
        assert!(tail.contains("STOPPED"));
        assert_eq!(engine.send("ATRV").await, "ATRV|12.6V|");
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_sequence_stops_at_first_failure() {
        let adapter = MockAdapter::new(|command| match command {
            "ATBAD" => MockReply::echoed(command, &["?"]),
            other => crate::mock::elm327_reply(other),
        });
        let engine = engine_for(adapter.clone()).await;

        assert!(engine.send_init_sequence(&["ATE1", "ATH1"]).await);
        assert!(!engine.send_init_sequence(&["ATE1", "ATBAD", "ATS1"]).await);
        assert_eq!(adapter.count("ATS1"), 0);
    }
}
