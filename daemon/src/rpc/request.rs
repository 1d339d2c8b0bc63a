use core::fmt;

use crate::rpc::ProtocolError;

const SEPARATOR: char = ',';

// One method call as written on the wire: "method,arg1,arg2,..."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub args: Vec<String>,
}

impl Request {
    // Build a request, rejecting arguments that can't be written on one line
    pub fn new(
        method: &str,
        args: Vec<String>,
    ) -> Result<Self, ProtocolError> {
        let method = method.trim();

        if method.is_empty() || method.contains([SEPARATOR, '\n', '\r']) {
            return Err(ProtocolError::InvalidMethod(method.to_string()));
        }

        let mut clean_args = Vec::with_capacity(args.len());
        for arg in args {
            if arg.contains([SEPARATOR, '\n', '\r']) {
                return Err(ProtocolError::InvalidArgument {
                    method: method.to_string(),
                    arg,
                });
            }

            clean_args.push(arg.trim().to_string());
        }

        Ok(Self {
            method: method.to_string(),
            args: clean_args,
        })
    }

    // Parse a request line. Surrounding whitespace is trimmed and
    // empty arguments are dropped
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.trim().split(SEPARATOR);

        let method = parts.next().unwrap_or_default().trim();
        if method.is_empty() {
            return Err(ProtocolError::EmptyRequest);
        }

        let args = parts
            .map(str::trim)
            .filter(|arg| !arg.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            method: method.to_string(),
            args,
        })
    }

    // Fetch and parse a positional argument
    pub fn arg<T>(&self, index: usize, name: &str) -> Result<T, ProtocolError>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.args.get(index).ok_or_else(|| {
            ProtocolError::MissingArgument {
                method: self.method.clone(),
                name: name.to_string(),
            }
        })?;

        raw.parse::<T>().map_err(|err| ProtocolError::BadArgument {
            method: self.method.clone(),
            name: name.to_string(),
            value: raw.clone(),
            reason: err.to_string(),
        })
    }

    // Fetch an optional trailing argument
    pub fn optional_arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.method)?;
        for arg in self.args.iter() {
            write!(f, "{SEPARATOR}{arg}")?;
        }

        Ok(())
    }
}
