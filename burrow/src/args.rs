//! Command line parsing.
//!
//! `burrow <mode> [options]`, where the mode is `origin` (run next to the
//! applications that dial in), `terminus` (run next to the service being
//! exposed) or `rendezvous` (run the public address broker).

use core::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::rendezvous::valid_title;

pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

pub fn get_help_string() -> &'static str {
    concat!(
        "Usage: burrow <mode> [options...]\n",
        "\n",
        "Modes:\n",
        "  origin      Accept local TCP connections and carry them to the peer.\n",
        "  terminus    Answer the peer's streams by dialing a local destination.\n",
        "  rendezvous  Run the address broker both endpoints register with.\n",
        "\n",
        "Options (origin and terminus):\n",
        "  -r, --rendezvous <host:port>   Address of the rendezvous broker (required)\n",
        "  -n, --room <identifier>        Shared room identifier (required, 2-255 bytes,\n",
        "                                 no '/', '.', spaces or line breaks)\n",
        "  -s, --spool-dir <path>         Directory for overflow chunks (default: temp dir)\n",
        "\n",
        "Options (origin):\n",
        "  -l, --listen <addr:port>       Local TCP address to accept connections on (required)\n",
        "\n",
        "Options (terminus):\n",
        "  -d, --destination <addr:port>  Local TCP address streams are dialed to (required)\n",
        "\n",
        "Options (rendezvous):\n",
        "  -l, --listen <addr:port>       UDP address to listen on (required)\n",
        "\n",
        "  -h, --help                     Print this help menu\n",
        "  -V, --version                  Print version information\n",
    )
}

#[derive(Debug, PartialEq)]
pub enum ArgumentsRequest {
    Help,
    Version,
    Run(StartupArguments),
}

#[derive(Debug, PartialEq)]
pub struct StartupArguments {
    pub mode: StartupMode,
}

#[derive(Debug, PartialEq)]
pub enum StartupMode {
    Origin {
        rendezvous: String,
        room: String,
        listen: SocketAddr,
        spool_dir: PathBuf,
    },
    Terminus {
        rendezvous: String,
        room: String,
        destination: SocketAddr,
        spool_dir: PathBuf,
    },
    Rendezvous {
        listen: SocketAddr,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    MissingMode,
    UnknownMode(String),
    UnknownArgument(String),
    ExpectedValue(String),
    InvalidAddress(String, String),
    InvalidRoom(String),
    MissingRendezvous,
    MissingRoom,
    MissingListen,
    MissingDestination,
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingMode => write!(f, "You must specify a mode: origin, terminus or rendezvous"),
            Self::UnknownMode(mode) => write!(f, "Unknown mode: {mode}"),
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::ExpectedValue(arg) => write!(f, "Expected a value after {arg}"),
            Self::InvalidAddress(arg, value) => write!(f, "Invalid address after {arg}: {value}"),
            Self::InvalidRoom(room) => write!(
                f,
                "Invalid room identifier \"{room}\": must be 2-255 bytes with no '/', '.', spaces or line breaks"
            ),
            Self::MissingRendezvous => write!(f, "You must specify the rendezvous address with -r/--rendezvous"),
            Self::MissingRoom => write!(f, "You must specify the room identifier with -n/--room"),
            Self::MissingListen => write!(f, "You must specify the listen address with -l/--listen"),
            Self::MissingDestination => write!(f, "You must specify the destination address with -d/--destination"),
        }
    }
}

fn parse_address_arg(arg: String, maybe_value: Option<String>) -> Result<SocketAddr, ArgumentsError> {
    let value = maybe_value.ok_or_else(|| ArgumentsError::ExpectedValue(arg.clone()))?;

    value
        .parse::<SocketAddr>()
        .map_err(|_| ArgumentsError::InvalidAddress(arg, value))
}

pub fn parse_arguments<T>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError>
where
    T: Iterator<Item = String>,
{
    let mut mode_word = None;
    let mut rendezvous = None;
    let mut room = None;
    let mut listen = None;
    let mut destination = None;
    let mut spool_dir = None;

    // Ignore the first argument, as it's by convention the name of the program
    args.next();

    while let Some(arg) = args.next() {
        if arg.is_empty() {
            continue;
        } else if arg.eq("-h") || arg.eq_ignore_ascii_case("--help") {
            return Ok(ArgumentsRequest::Help);
        } else if arg.eq("-V") || arg.eq_ignore_ascii_case("--version") {
            return Ok(ArgumentsRequest::Version);
        } else if arg.eq("-r") || arg.eq_ignore_ascii_case("--rendezvous") {
            let value = args.next().ok_or(ArgumentsError::ExpectedValue(arg))?;
            rendezvous = Some(value);
        } else if arg.eq("-n") || arg.eq_ignore_ascii_case("--room") {
            let value = args.next().ok_or(ArgumentsError::ExpectedValue(arg))?;
            if !valid_title(value.as_bytes()) {
                return Err(ArgumentsError::InvalidRoom(value));
            }
            room = Some(value);
        } else if arg.eq("-l") || arg.eq_ignore_ascii_case("--listen") {
            listen = Some(parse_address_arg(arg, args.next())?);
        } else if arg.eq("-d") || arg.eq_ignore_ascii_case("--destination") {
            destination = Some(parse_address_arg(arg, args.next())?);
        } else if arg.eq("-s") || arg.eq_ignore_ascii_case("--spool-dir") {
            let value = args.next().ok_or(ArgumentsError::ExpectedValue(arg))?;
            spool_dir = Some(PathBuf::from(value));
        } else if mode_word.is_none() && !arg.starts_with('-') {
            mode_word = Some(arg);
        } else {
            return Err(ArgumentsError::UnknownArgument(arg));
        }
    }

    let spool_dir = spool_dir.unwrap_or_else(std::env::temp_dir);

    let mode = match mode_word.as_deref() {
        None => return Err(ArgumentsError::MissingMode),
        Some("origin") => StartupMode::Origin {
            rendezvous: rendezvous.ok_or(ArgumentsError::MissingRendezvous)?,
            room: room.ok_or(ArgumentsError::MissingRoom)?,
            listen: listen.ok_or(ArgumentsError::MissingListen)?,
            spool_dir,
        },
        Some("terminus") => StartupMode::Terminus {
            rendezvous: rendezvous.ok_or(ArgumentsError::MissingRendezvous)?,
            room: room.ok_or(ArgumentsError::MissingRoom)?,
            destination: destination.ok_or(ArgumentsError::MissingDestination)?,
            spool_dir,
        },
        Some("rendezvous") => StartupMode::Rendezvous {
            listen: listen.ok_or(ArgumentsError::MissingListen)?,
        },
        Some(other) => return Err(ArgumentsError::UnknownMode(other.to_string())),
    };

    Ok(ArgumentsRequest::Run(StartupArguments { mode }))
}
