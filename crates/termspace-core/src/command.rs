//! Command classifier
//!
//! Pure predicates over a shell command line, used to decide whether a
//! command the user typed should be handed to the process supervisor as
//! a long-running child (dev servers, watchers, tail -f and friends).

use once_cell::sync::Lazy;
use regex::Regex;

/// Commands that are long-running by name alone.
const LONG_RUNNING_PREFIXES: &[&str] = &[
    "npm run dev",
    "npm start",
    "yarn dev",
    "yarn start",
    "pnpm dev",
    "pnpm start",
    "next dev",
    "vite",
    "webpack serve",
    "webpack-dev-server",
    "nodemon",
    "ts-node-dev",
    "tsx watch",
    "python manage.py runserver",
    "rails server",
    "php -S",
    "serve",
    "http-server",
    "live-server",
    "docker-compose up",
    "docker run",
];

/// Commands that are long-running only when combined with a watch flag.
const WATCHABLE_PREFIXES: &[&str] = &[
    "jest",
    "mocha",
    "vitest",
    "pytest",
    "cargo test",
    "go test",
    "npm test",
    "yarn test",
    "tsc",
];

/// Subset of long-running commands that are development servers; the
/// supervisor restarts these automatically on crash.
const DEV_SERVER_PREFIXES: &[&str] = &[
    "npm run dev",
    "npm start",
    "yarn dev",
    "yarn start",
    "pnpm dev",
    "pnpm start",
    "next dev",
    "vite",
    "webpack serve",
    "webpack-dev-server",
    "nodemon",
    "python manage.py runserver",
    "rails server",
    "php -S",
    "docker-compose up",
];

static LONG_RUNNING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b--watch\b",
        r"\b--hot\b",
        r"\b--reload\b",
        r"\b--dev\b",
        r"\b--serve\b",
        r"serve.*--",
        r"python.*-m.*http\.server",
        r"python.*-m.*uvicorn",
        r"python.*-m.*gunicorn",
        r"-p\s+\d+.*--",
        r"--port\s+\d+",
        r"tail\s+-f",
        r"watch\s+",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid classifier pattern"))
    .collect()
});

static WATCH_FLAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)(?:--watch|-w)(?:\s|$)").unwrap());

/// A command line split into the executable token and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: String,
    pub args: Vec<String>,
}

/// Should this command line be tracked as a long-running process?
pub fn should_track_command(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.len() < 3 {
        return false;
    }

    if LONG_RUNNING_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
    {
        return true;
    }

    if WATCHABLE_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
        && WATCH_FLAG.is_match(trimmed)
    {
        return true;
    }

    LONG_RUNNING_PATTERNS.iter().any(|re| re.is_match(trimmed))
}

/// Split a command line into command + args, collapsing whitespace.
pub fn parse_command(line: &str) -> ParsedCommand {
    let mut tokens = line.split_whitespace().map(str::to_string);
    ParsedCommand {
        command: tokens.next().unwrap_or_default(),
        args: tokens.collect(),
    }
}

/// Is this a development server (restart-on-crash candidate)?
pub fn is_development_server(line: &str) -> bool {
    let trimmed = line.trim();
    DEV_SERVER_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
}
