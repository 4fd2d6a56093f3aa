//! Credential redaction for log output and client-facing error bodies
//!
//! Upstream error bodies and reqwest errors can echo request material back
//! (token endpoint responses, `Authorization` headers in debug output). Every
//! log line goes through `RedactingMakeWriter`, and upstream bodies are passed
//! through `redact` before being returned to clients.

use std::borrow::Cow;
use std::io;
use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;

/// Placeholder substituted for every credential-shaped match.
pub const REDACTED: &str = "[REDACTED]";

/// `access_token":"…`, `refresh_token=…`, `"api_key": "…"` (plain or JSON-escaped quotes)
static TOKEN_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<key>access_token|refresh_token|api_key|apiKey|accessToken|refreshToken|id_token)(?P<sep>\\?"?\s*[:=]\s*\\?"?)[^"\\&\s,}]+"#,
    )
    .expect("token field pattern is valid")
});

static BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<scheme>bearer\s+)[A-Za-z0-9._~+/=\-]+").expect("bearer pattern is valid")
});

static JWT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]*").expect("jwt pattern is valid")
});

/// Provider secret keys: `sk-ant-api03-…`, `sk-ant-oat01-…`, `sk-proj-…`
static SECRET_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sk-[A-Za-z0-9_\-]{8,}").expect("secret key pattern is valid")
});

/// Replace credential-shaped substrings with `[REDACTED]`.
///
/// Returns the input unchanged (borrowed) when nothing matches.
pub fn redact(input: &str) -> Cow<'_, str> {
    let rules: [(&Regex, &str); 4] = [
        (&*TOKEN_FIELD, "${key}${sep}[REDACTED]"),
        (&*BEARER, "${scheme}[REDACTED]"),
        (&*JWT, REDACTED),
        (&*SECRET_KEY, REDACTED),
    ];

    if !rules.iter().any(|(re, _)| re.is_match(input)) {
        return Cow::Borrowed(input);
    }

    let mut out = input.to_string();
    for (re, replacement) in rules {
        out = re.replace_all(&out, replacement).into_owned();
    }
    Cow::Owned(out)
}

/// `io::Write` adapter that redacts each formatted log record before passing
/// it to the wrapped writer.
pub struct RedactingWriter<W> {
    inner: W,
}

impl<W> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write> io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(redact(&text).as_bytes())?;
        // The caller's bytes were fully consumed even if redaction changed the length
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// `MakeWriter` wrapper for `tracing_subscriber::fmt` layers.
///
/// ```ignore
/// tracing_subscriber::fmt::layer()
///     .json()
///     .with_writer(RedactingMakeWriter::new(std::io::stdout))
/// ```
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for RedactingMakeWriter<M> {
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}
