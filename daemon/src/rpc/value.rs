use core::fmt;

// Text used on the wire for the absence of a value
pub const NULL_TOKEN: &str = "None";

const TRUE_TOKEN: &str = "True";
const FALSE_TOKEN: &str = "False";

// A single value exchanged over the wire.
//
// Strings that would be read back as another variant are sent quoted,
// unquoted text is decoded with the following precedence: tuple literal,
// integer, boolean, null token and finally raw string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<WireValue>),
}

impl WireValue {
    // Decode the text of a response
    pub fn decode(text: &str) -> WireValue {
        let text = text.trim();

        if let Some(items) = split_tuple(text) {
            return WireValue::List(
                items.into_iter().map(decode_scalar).collect(),
            );
        }

        decode_scalar(text)
    }

    // Encode the value the way it is written on the wire
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, WireValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WireValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[WireValue]> {
        match self {
            WireValue::List(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>, nested: bool) -> fmt::Result {
        match self {
            WireValue::Null => f.write_str(NULL_TOKEN),
            WireValue::Bool(true) => f.write_str(TRUE_TOKEN),
            WireValue::Bool(false) => f.write_str(FALSE_TOKEN),
            WireValue::Int(value) => write!(f, "{value}"),
            WireValue::Str(value) => {
                if needs_quotes(value, nested) {
                    write_quoted(f, value)
                } else {
                    f.write_str(value)
                }
            }
            WireValue::List(values) => {
                f.write_str("(")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    value.fmt_nested(f, true)?;
                }
                // A one element tuple keeps its trailing comma
                if values.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_nested(f, false)
    }
}

impl From<bool> for WireValue {
    fn from(value: bool) -> Self {
        WireValue::Bool(value)
    }
}

impl From<i64> for WireValue {
    fn from(value: i64) -> Self {
        WireValue::Int(value)
    }
}

impl From<i32> for WireValue {
    fn from(value: i32) -> Self {
        WireValue::Int(value.into())
    }
}

impl From<u32> for WireValue {
    fn from(value: u32) -> Self {
        WireValue::Int(value.into())
    }
}

impl From<usize> for WireValue {
    fn from(value: usize) -> Self {
        WireValue::Int(value as i64)
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        WireValue::Str(value)
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        WireValue::Str(value.to_string())
    }
}

impl From<Vec<WireValue>> for WireValue {
    fn from(values: Vec<WireValue>) -> Self {
        WireValue::List(values)
    }
}

impl<T: Into<WireValue>> From<Option<T>> for WireValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(WireValue::Null, Into::into)
    }
}

// Decode a value that is not a tuple
fn decode_scalar(text: &str) -> WireValue {
    let text = text.trim();

    if let Some(unquoted) = unquote(text) {
        return WireValue::Str(unquoted);
    }

    if is_integer(text) {
        if let Ok(value) = text.parse::<i64>() {
            return WireValue::Int(value);
        }
    }

    if text.eq_ignore_ascii_case("true") {
        return WireValue::Bool(true);
    }
    if text.eq_ignore_ascii_case("false") {
        return WireValue::Bool(false);
    }

    if text == NULL_TOKEN {
        return WireValue::Null;
    }

    WireValue::Str(text.to_string())
}

// Optional minus sign followed by ASCII digits only
fn is_integer(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);

    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

// Split a parenthesised tuple literal into its top level elements.
// Return None if the text is not a well formed tuple
fn split_tuple(text: &str) -> Option<Vec<&str>> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;

    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in inner.char_indices() {
        if in_quotes {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_quotes = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_quotes = true,
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1)?,
            ',' if depth == 0 => {
                items.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if in_quotes || depth != 0 {
        return None;
    }

    // An empty tail is either "()" or the trailing comma of "(x,)"
    let last = &inner[start..];
    if !last.trim().is_empty() {
        items.push(last);
    }

    // An empty element in the middle means the literal is malformed
    if items.iter().any(|item| item.trim().is_empty()) {
        return None;
    }

    Some(items)
}

// Strip the quotes of a quoted string and resolve its escapes
fn unquote(text: &str) -> Option<String> {
    let inner = text.strip_prefix('"')?.strip_suffix('"')?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                other => out.push(other),
            },
            // An unescaped quote inside means this is not one quoted string
            '"' => return None,
            other => out.push(other),
        }
    }

    Some(out)
}

fn needs_quotes(value: &str, nested: bool) -> bool {
    if value.is_empty() || value.trim() != value || value.contains('\n') {
        return true;
    }

    if nested && value.contains([',', '(', ')']) {
        return true;
    }

    // Quote any text that an unquoted decode would not give back as is
    let decoded = if nested {
        decode_scalar(value)
    } else {
        WireValue::decode(value)
    };

    decoded != WireValue::Str(value.to_string())
}

fn write_quoted(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in value.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            other => write!(f, "{other}")?,
        }
    }
    f.write_str("\"")
}
