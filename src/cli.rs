//! Utility to parse command line arguments for the server, client and forwarder programs.

use crate::core::*;


const DEFAULT_MESSAGE_NUM: usize = 500;
/// Argument disabling the upstream subscription of the server.
const NO_UPSTREAM: &str = "-";


/// Utility class to help with command line option parsing.
pub struct ArgParser<I: Iterator<Item = String>> {
    args: I,
    usage: &'static str,
}

impl<I: Iterator<Item = String>> ArgParser<I> {
    /// Create a parser over the program arguments, program name included.
    pub fn new(mut args: I, usage: &'static str) -> Self {
        let _ = args.next();
        Self { args, usage }
    }

    pub fn usage(&self) -> &'static str {
        self.usage
    }

    pub fn extract_message_num(&mut self) -> Result<usize, RelayError> {
        match self.args.next() {
            Some(num_str) => num_str.parse().map_err(
                |_| self.error(format!("could not parse provided number {} as usize", num_str))),
            None => Ok(DEFAULT_MESSAGE_NUM),
        }
    }

    pub fn extract_port(&mut self) -> Result<u16, RelayError> {
        match self.args.next() {
            Some(port_str) => port_str.parse().map_err(
                |_| self.error(format!("could not parse provided port number {} as u16", port_str))),
            None => Ok(DEFAULT_LISTEN_PORT),
        }
    }

    /// Upstream feed URL: the default feed when absent, none when `-`.
    pub fn extract_upstream_url(&mut self) -> Result<Option<String>, RelayError> {
        match self.args.next() {
            Some(url) if url == NO_UPSTREAM => Ok(None),
            Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => Ok(Some(url)),
            Some(url) => Err(self.error(format!("upstream URL {} must start with ws:// or wss://", url))),
            None => Ok(Some(DEFAULT_UPSTREAM_URL.to_string())),
        }
    }

    pub fn extract_echo_policy(&mut self) -> Result<EchoPolicy, RelayError> {
        match self.args.next().as_deref() {
            None | Some("echo") => Ok(EchoPolicy::All),
            Some("no-echo") => Ok(EchoPolicy::ExcludeOrigin),
            Some(other) => Err(self.error(format!("echo policy {} must be echo or no-echo", other))),
        }
    }

    /// Server configuration: `[port] [upstream url|-] [echo|no-echo]`.
    pub fn extract_relay_config(&mut self) -> Result<RelayConfig, RelayError> {
        let listen_port = self.extract_port()?;
        let upstream_url = self.extract_upstream_url()?;
        let echo_policy = self.extract_echo_policy()?;
        self.finish()?;
        Ok(RelayConfig { listen_port, upstream_url, echo_policy, ..RelayConfig::default() })
    }

    /// Fail if arguments are left over.
    pub fn finish(&mut self) -> Result<(), RelayError> {
        match self.args.next() {
            Some(extra) => Err(self.error(format!("unexpected argument {}", extra))),
            None => Ok(()),
        }
    }

    fn error(&self, reason: String) -> RelayError {
        RelayError::Config(format!("{}\n{}", reason, self.usage))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const USAGE: &str = "Usage: test";

    fn parser(args: &[&str]) -> ArgParser<std::vec::IntoIter<String>> {
        let mut all = vec!["program".to_string()];
        all.extend(args.iter().map(|s| s.to_string()));
        ArgParser::new(all.into_iter(), USAGE)
    }

    #[test]
    fn test_defaults() {
        let config = parser(&[]).extract_relay_config().unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_full_server_arguments() {
        let config = parser(&["9001", "ws://localhost:9000", "no-echo"]).extract_relay_config().unwrap();
        assert_eq!(config.listen_port, 9001);
        assert_eq!(config.upstream_url.as_deref(), Some("ws://localhost:9000"));
        assert_eq!(config.echo_policy, EchoPolicy::ExcludeOrigin);
    }

    #[test]
    fn test_no_upstream() {
        let config = parser(&["9001", "-"]).extract_relay_config().unwrap();
        assert_eq!(config.upstream_url, None);
    }

    #[test]
    fn test_bad_port() {
        match parser(&["http"]).extract_port() {
            Err(RelayError::Config(reason)) => assert!(reason.ends_with(USAGE)),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_bad_upstream_url() {
        assert!(parser(&["http://example.com"]).extract_upstream_url().is_err());
    }

    #[test]
    fn test_extra_argument() {
        assert!(parser(&["9001", "-", "echo", "more"]).extract_relay_config().is_err());
    }

    #[test]
    fn test_message_num() {
        assert_eq!(parser(&["12"]).extract_message_num().unwrap(), 12);
        assert_eq!(parser(&[]).extract_message_num().unwrap(), DEFAULT_MESSAGE_NUM);
        assert!(parser(&["many"]).extract_message_num().is_err());
    }
}
