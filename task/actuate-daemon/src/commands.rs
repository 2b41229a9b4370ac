//! Parses the textual command stream (§4.H): single characters each
//! followed by an unsigned decimal integer, tokens separated by whitespace.

use trace_proto::{ActuationEvent, ActuationPin, Level};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Arm the scheduler at an absolute or now-relative wall-clock second.
    Arm(u64),
    /// Cancel the timer, clear the queue, drive SIG1/SIG2 low.
    Cancel,
    /// Enqueue a pin-level change at the given microsecond offset.
    Enqueue(ActuationEvent),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("unrecognized command character '{0}'")]
    UnknownChar(char),
    #[error("command '{0}' is missing its integer argument")]
    MissingArgument(char),
    #[error("argument to '{0}' is not a valid unsigned integer")]
    InvalidArgument(char),
}

/// Parses every command in `input`, returning the commands that parsed
/// successfully and a count of the ones that didn't. Tokens are delimited
/// by whitespace, so one malformed token is exactly one error and never
/// cascades into misparsing the rest of the stream.
pub fn parse_commands(input: &str) -> (Vec<Command>, usize) {
    let mut commands = Vec::new();
    let mut errors = 0;

    for token in input.split_whitespace() {
        let mut chars = token.chars();
        let c = chars.next().expect("split_whitespace never yields empty tokens");
        let digits = chars.as_str();
        match parse_one(c, digits) {
            Ok(cmd) => commands.push(cmd),
            Err(_) => errors += 1,
        }
    }

    (commands, errors)
}

fn parse_one(c: char, digits: &str) -> Result<Command, ParseError> {
    if digits.is_empty() && c != 'C' && c != 'c' {
        return Err(ParseError::MissingArgument(c));
    }
    let arg64 = || digits.parse::<u64>().map_err(|_| ParseError::InvalidArgument(c));
    let arg32 = || digits.parse::<u32>().map_err(|_| ParseError::InvalidArgument(c));

    match c {
        'S' | 's' => Ok(Command::Arm(arg64()?)),
        'C' | 'c' => Ok(Command::Cancel),
        'H' => Ok(enqueue(ActuationPin::Sig1, Level::Set, arg32()?)),
        'h' => Ok(enqueue(ActuationPin::Sig2, Level::Set, arg32()?)),
        'L' => Ok(enqueue(ActuationPin::Sig1, Level::Clear, arg32()?)),
        'l' => Ok(enqueue(ActuationPin::Sig2, Level::Clear, arg32()?)),
        'T' => Ok(enqueue(ActuationPin::Sig1, Level::Toggle, arg32()?)),
        't' => Ok(enqueue(ActuationPin::Sig2, Level::Toggle, arg32()?)),
        'R' => Ok(enqueue(ActuationPin::NReset, Level::Set, arg32()?)),
        'r' => Ok(enqueue(ActuationPin::NReset, Level::Clear, arg32()?)),
        'P' => Ok(enqueue(ActuationPin::Pps, Level::Set, arg32()?)),
        'p' => Ok(enqueue(ActuationPin::Pps, Level::Clear, arg32()?)),
        'A' => Ok(enqueue(ActuationPin::ActuationEnable, Level::Set, arg32()?)),
        'a' => Ok(enqueue(ActuationPin::ActuationEnable, Level::Clear, arg32()?)),
        other => Err(ParseError::UnknownChar(other)),
    }
}

fn enqueue(pin: ActuationPin, level: Level, offset_us: u32) -> Command {
    let offset_us = if offset_us < trace_proto::MIN_PERIOD_US { 0 } else { offset_us };
    Command::Enqueue(ActuationEvent { offset_us, pin, level })
}

/// Resolves a `Command::Arm` argument the same way the capture binary
/// resolves `starttime`: values under 1000 are relative to now.
pub fn resolve_arm_target(arg: u64, now_s: u64) -> u64 {
    if arg < 1000 {
        now_s + arg
    } else {
        arg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_command_stream() {
        let (cmds, errs) = parse_commands("H1000 l0 C");
        assert_eq!(errs, 0);
        assert_eq!(
            cmds,
            vec![
                Command::Enqueue(ActuationEvent { offset_us: 1000, pin: ActuationPin::Sig1, level: Level::Set }),
                Command::Enqueue(ActuationEvent { offset_us: 0, pin: ActuationPin::Sig2, level: Level::Clear }),
                Command::Cancel,
            ]
        );
    }

    #[test]
    fn counts_unknown_and_malformed_commands() {
        let (cmds, errs) = parse_commands("Zfoo H");
        assert!(cmds.is_empty());
        assert_eq!(errs, 2);
    }

    #[test]
    fn sub_min_period_offsets_snap_to_zero() {
        let (cmds, _) = parse_commands("H5");
        assert_eq!(cmds[0], Command::Enqueue(ActuationEvent { offset_us: 0, pin: ActuationPin::Sig1, level: Level::Set }));
    }

    #[test]
    fn arm_target_below_1000_is_relative() {
        assert_eq!(resolve_arm_target(5, 1_000_000), 1_000_005);
        assert_eq!(resolve_arm_target(2_000_000, 1_000_000), 2_000_000);
    }
}
