use log::{debug, trace};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_till1, take_until, take_while1};
use nom::character::complete::{char, multispace0, multispace1};
use nom::combinator::{all_consuming, map, rest, verify};
use nom::error::{Error, ErrorKind};
use nom::multi::separated_list0;
use nom::sequence::{delimited, pair, preceded, separated_pair, terminated, tuple};
use nom::IResult;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::variables::{EvalContext, Value};

static VARIABLE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\(([^)]+)\)").unwrap());

// Names that resolve to an empty string inside <esi:vars> even when unset.
const BUILTIN_FALLBACKS: [&str; 4] =
    ["HTTP_HOST", "HTTP_USER_AGENT", "REQUEST_PATH", "QUERY_STRING"];

/// A parsed assignment value or expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Text with `$(name)` references, substituted when evaluated.
    Interpolated(String),
    /// A token that is not a literal. It evaluates to itself.
    Bare(String),
    Concat(Vec<Expr>),
}

impl Expr {
    pub fn evaluate(&self, ctx: &EvalContext) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Interpolated(text) => Value::String(process_variables(text, ctx)),
            Expr::Bare(text) => Value::String(text.clone()),
            Expr::Concat(parts) => Value::String(
                parts
                    .iter()
                    .map(|part| part.evaluate(ctx).to_string())
                    .collect(),
            ),
        }
    }
}

/// A parsed `test` attribute. Variants are listed in matching priority.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Exists { name: String, negated: bool },
    Equals { name: String, value: String },
    Matches { name: String, pattern: String },
    Call { function: String, arguments: String },
    Unrecognized,
}

/// A parsed `collection` attribute of `<esi:foreach>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Collection {
    Split { name: String, separator: String },
    Variable(String),
    Literal(Vec<String>),
    Empty,
}

/// Evaluates a literal: quoted string, `true`/`false`, or a number.
/// Anything else is returned verbatim as a string.
pub fn evaluate_expression(text: &str) -> Value {
    parse_literal(text).evaluate(&EvalContext::new())
}

fn parse_literal(text: &str) -> Expr {
    if let Some(inner) = unquote(text) {
        return Expr::Literal(Value::String(inner.to_string()));
    }
    match text {
        "true" => Expr::Literal(Value::Boolean(true)),
        "false" => Expr::Literal(Value::Boolean(false)),
        _ => match parse_number(text) {
            Some(n) => Expr::Literal(Value::Number(n)),
            None => Expr::Bare(text.to_string()),
        },
    }
}

fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty()
        || !text
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
    {
        return None;
    }
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Strips one level of triple or single quotes.
pub fn unquote(text: &str) -> Option<&str> {
    if text.len() >= 6 && text.starts_with("'''") && text.ends_with("'''") {
        Some(&text[3..text.len() - 3])
    } else if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        Some(&text[1..text.len() - 1])
    } else {
        None
    }
}

/// Splits `text` on `separator` wherever it occurs outside quotes, parentheses and braces.
pub fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' | '{' | '[' if !in_quote => depth += 1,
            ')' | '}' | ']' if !in_quote => depth = depth.saturating_sub(1),
            c if c == separator && !in_quote && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn parse_concatenation(text: &str) -> Expr {
    Expr::Concat(
        split_top_level(text, '+')
            .into_iter()
            .map(str::trim)
            .map(|part| {
                if let Some(inner) = unquote(part) {
                    Expr::Literal(Value::String(inner.to_string()))
                } else if part.contains("$(") {
                    Expr::Interpolated(part.to_string())
                } else {
                    parse_literal(part)
                }
            })
            .collect(),
    )
}

/// Evaluates `'a' + $(b) + 'c'` style concatenation into a string.
pub fn evaluate_concatenation(text: &str, ctx: &EvalContext) -> String {
    parse_concatenation(text).evaluate(ctx).to_string()
}

/// Parses the value of an `<esi:assign>`.
pub fn parse_assignment(value: &str) -> Expr {
    let value = value.trim();
    if split_top_level(value, '+').len() > 1 {
        return parse_concatenation(value);
    }
    if value.contains("$(") {
        return Expr::Interpolated(value.to_string());
    }
    if value.len() >= 6 && value.starts_with("'''") && value.ends_with("'''") {
        return Expr::Literal(Value::String(value[3..value.len() - 3].to_string()));
    }
    if let Ok((_, items)) = all_consuming(list_literal)(value) {
        return Expr::Literal(Value::List(items));
    }
    if let Ok((_, entries)) = all_consuming(dictionary_literal)(value) {
        return Expr::Literal(Value::Dictionary(entries.into_iter().collect()));
    }
    parse_literal(value)
}

/// Replaces every `$(name)` with the string form of the variable.
/// Unknown names are left in place as the literal `$(name)` token.
pub fn process_variables(text: &str, ctx: &EvalContext) -> String {
    VARIABLE_REF
        .replace_all(text, |caps: &Captures| match ctx.get_variable(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Variable substitution used by `<esi:vars>`.
///
/// On top of plain references it understands `HTTP_COOKIE{'k'}`,
/// `QUERY_STRING{'k'}`, `GEO{'k'}`, indexing into stored lists and
/// dictionaries with `name{key}`, nested references inside the key, and
/// `$(name|'default')` fallbacks.
pub fn interpolate_vars(text: &str, ctx: &EvalContext) -> String {
    let mut output = String::with_capacity(text.len());
    let mut remaining = text;
    while let Some(start) = remaining.find("$(") {
        output.push_str(&remaining[..start]);
        let after = &remaining[start + 2..];
        match find_closing(after) {
            Some(end) => {
                output.push_str(&render_reference(&after[..end], ctx));
                remaining = &after[end + 1..];
            }
            None => {
                output.push_str(&remaining[start..]);
                remaining = "";
            }
        }
    }
    output.push_str(remaining);
    output
}

fn render_reference(reference: &str, ctx: &EvalContext) -> String {
    let mut parts = split_top_level(reference, '|').into_iter();
    let name = parts.next().unwrap_or_default().trim();
    let default = parts.next().map(str::trim);

    if let Some(value) = resolve_reference(name, ctx) {
        return value;
    }
    if let Some(default) = default {
        return match unquote(default) {
            Some(inner) => inner.to_string(),
            None => interpolate_vars(default, ctx),
        };
    }
    if name.contains('{') || BUILTIN_FALLBACKS.contains(&name) {
        String::new()
    } else {
        trace!("leaving unresolved reference `$({})` in place", reference);
        format!("$({reference})")
    }
}

/// Resolves the inside of a `$(...)` reference, `None` when it is unset.
pub fn resolve_reference(name: &str, ctx: &EvalContext) -> Option<String> {
    let Some((base, key)) = split_subscript(name) else {
        return ctx.get_variable(name).map(Value::to_string);
    };
    let key = match unquote(key) {
        Some(inner) => inner.to_string(),
        None if key.contains("$(") => interpolate_vars(key, ctx),
        None => key.to_string(),
    };
    match base {
        "HTTP_COOKIE" | "QUERY_STRING" | "GEO" => ctx
            .get_variable(&format!("{base}_{key}"))
            .map(Value::to_string),
        _ => ctx
            .get_variable(base)
            .and_then(|value| value.index(&key))
            .map(str::to_string),
    }
}

fn split_subscript(name: &str) -> Option<(&str, &str)> {
    let open = name.find('{')?;
    let inner = name[open + 1..].strip_suffix('}')?;
    Some((&name[..open], inner))
}

/// Byte offset of the `)` closing a reference whose `(` was just consumed.
pub(crate) fn find_closing(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_quote = false;
    for (i, c) in text.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

fn variable_ref(input: &str) -> IResult<&str, &str> {
    let (after, _) = tag("$(")(input)?;
    match find_closing(after) {
        Some(end) if end > 0 => Ok((&after[end + 1..], &after[..end])),
        _ => Err(nom::Err::Error(Error::new(input, ErrorKind::Char))),
    }
}

fn exists(input: &str) -> IResult<&str, &str> {
    delimited(
        pair(tag("$exists("), multispace0),
        variable_ref,
        pair(multispace0, char(')')),
    )(input)
}

fn negated_exists(input: &str) -> IResult<&str, &str> {
    preceded(pair(char('!'), multispace0), exists)(input)
}

fn equality(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        variable_ref,
        delimited(multispace0, tag("=="), multispace0),
        rest,
    )(input)
}

fn matches_operator(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        variable_ref,
        delimited(multispace1, tag("matches"), multispace1),
        rest,
    )(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        |s: &str| !s.starts_with(|c: char| c.is_ascii_digit()),
    )(input)
}

fn function_call(input: &str) -> IResult<&str, (&str, &str)> {
    tuple((preceded(char('$'), identifier), preceded(char('('), rest)))(input)
        .map(|(remaining, (name, args))| {
            let args = args.trim_end();
            let args = args.strip_suffix(')').unwrap_or(args);
            (remaining, (name, args))
        })
}

/// Parses a single condition, trying each rule in priority order.
pub fn parse_condition(text: &str) -> Condition {
    let text = text.trim();
    if let Ok((_, name)) = negated_exists(text) {
        return Condition::Exists {
            name: name.to_string(),
            negated: true,
        };
    }
    if let Ok((_, name)) = exists(text) {
        return Condition::Exists {
            name: name.to_string(),
            negated: false,
        };
    }
    if let Ok((_, (name, value))) = equality(text) {
        let value = value.trim();
        return Condition::Equals {
            name: name.to_string(),
            value: unquote(value).unwrap_or(value).to_string(),
        };
    }
    if let Ok((_, (name, pattern))) = matches_operator(text) {
        let pattern = pattern.trim();
        return Condition::Matches {
            name: name.to_string(),
            pattern: unquote(pattern).unwrap_or(pattern).to_string(),
        };
    }
    if let Ok((_, (function, arguments))) = function_call(text) {
        return Condition::Call {
            function: function.to_string(),
            arguments: arguments.to_string(),
        };
    }
    Condition::Unrecognized
}

impl Condition {
    pub fn evaluate(&self, ctx: &EvalContext) -> bool {
        match self {
            Condition::Exists { name, negated } => {
                resolve_reference(name, ctx).is_some() != *negated
            }
            Condition::Equals { name, value } => {
                resolve_reference(name, ctx).is_some_and(|actual| actual == *value)
            }
            Condition::Matches { name, pattern } => match Regex::new(pattern) {
                Ok(re) => re.is_match(&resolve_reference(name, ctx).unwrap_or_default()),
                Err(err) => {
                    debug!("invalid pattern `{}` in condition: {}", pattern, err);
                    false
                }
            },
            Condition::Call { function, arguments } => {
                if ctx.get_function(function).is_some() {
                    debug!(
                        "user-defined function `{}({})` is not executed in conditions",
                        function, arguments
                    );
                }
                false
            }
            Condition::Unrecognized => false,
        }
    }
}

/// Evaluates a single condition; unrecognised conditions are false.
pub fn evaluate_condition(text: &str, ctx: &EvalContext) -> bool {
    parse_condition(text).evaluate(ctx)
}

/// Evaluates an `<esi:when>` test: `|`-separated conditions, true if any is.
pub fn evaluate_when_condition(text: &str, ctx: &EvalContext) -> bool {
    split_top_level(text, '|')
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .any(|part| evaluate_condition(part, ctx))
}

fn quoted_string(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(tag("'''"), take_until("'''"), tag("'''")),
        delimited(char('\''), take_until("'"), char('\'')),
    ))(input)
}

fn list_item(input: &str) -> IResult<&str, String> {
    alt((
        map(quoted_string, str::to_string),
        map(take_till1(|c: char| c == ',' || c == ']'), |s: &str| {
            s.trim().to_string()
        }),
    ))(input)
}

fn list_literal(input: &str) -> IResult<&str, Vec<String>> {
    delimited(
        pair(char('['), multispace0),
        separated_list0(delimited(multispace0, char(','), multispace0), list_item),
        pair(multispace0, char(']')),
    )(input)
}

fn dictionary_entry(input: &str) -> IResult<&str, (String, String)> {
    separated_pair(
        map(quoted_string, str::to_string),
        delimited(multispace0, char(':'), multispace0),
        alt((
            map(quoted_string, str::to_string),
            map(take_till1(|c: char| c == ',' || c == '}'), |s: &str| {
                s.trim().to_string()
            }),
        )),
    )(input)
}

fn dictionary_literal(input: &str) -> IResult<&str, Vec<(String, String)>> {
    delimited(
        pair(char('{'), multispace0),
        separated_list0(
            delimited(multispace0, char(','), multispace0),
            dictionary_entry,
        ),
        pair(multispace0, char('}')),
    )(input)
}

fn split_source(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(
            pair(tag("$str("), multispace0),
            variable_ref,
            pair(multispace0, char(')')),
        ),
        variable_ref,
    ))(input)
}

fn string_split(input: &str) -> IResult<&str, (&str, &str)> {
    delimited(
        pair(tag("$string_split("), multispace0),
        separated_pair(
            split_source,
            delimited(multispace0, char(','), multispace0),
            quoted_string,
        ),
        pair(multispace0, char(')')),
    )(input)
}

pub fn parse_collection(text: &str) -> Collection {
    let text = text.trim();
    if let Ok((_, (name, separator))) = all_consuming(string_split)(text) {
        return Collection::Split {
            name: name.to_string(),
            separator: separator.to_string(),
        };
    }
    if let Ok((_, name)) = all_consuming(variable_ref)(text) {
        return Collection::Variable(name.to_string());
    }
    if let Ok((_, items)) = all_consuming(terminated(list_literal, multispace0))(text) {
        return Collection::Literal(items);
    }
    Collection::Empty
}

impl Collection {
    pub fn evaluate(&self, ctx: &EvalContext) -> Vec<String> {
        match self {
            Collection::Split { name, separator } => match ctx.get_variable(name) {
                Some(Value::List(items)) => items.clone(),
                Some(value) if !separator.is_empty() => value
                    .to_string()
                    .split(separator.as_str())
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            },
            Collection::Variable(name) => match ctx.get_variable(name) {
                Some(Value::List(items)) => items.clone(),
                Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
                _ => Vec::new(),
            },
            Collection::Literal(items) => items.clone(),
            Collection::Empty => Vec::new(),
        }
    }
}

/// Derives the sequence an `<esi:foreach>` iterates over.
pub fn evaluate_collection(text: &str, ctx: &EvalContext) -> Vec<String> {
    parse_collection(text).evaluate(ctx)
}
