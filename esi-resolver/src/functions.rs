use crate::expression::{
    evaluate_expression, find_closing, interpolate_vars, split_top_level, unquote,
};
use crate::variables::{EvalContext, Value};
use crate::{ExecutionError, Result};
use log::{info, warn};

type Builtin = fn(&[Value]) -> Result<Value>;

/// Looks up a built-in function by name.
pub fn builtin(name: &str) -> Option<Builtin> {
    let function: Builtin = match name {
        "html_encode" => html_encode,
        "lower" => lower,
        "replace" => replace,
        "set_redirect" => set_redirect,
        "set_response_code" => set_response_code,
        "add_header" => add_header,
        "add_cachebusting_header" => add_cachebusting_header,
        "getCountryLanguageFromCookie" => get_country_language_from_cookie,
        _ => return None,
    };
    Some(function)
}

pub fn lower(args: &[Value]) -> Result<Value> {
    if args.len() != 1 {
        return Err(ExecutionError::FunctionError(
            "wrong number of arguments to 'lower'".to_string(),
        ));
    }

    Ok(Value::String(args[0].to_string().to_lowercase()))
}

/// Escapes `&`, `<`, `>`, `"` and `'`.
pub fn html_encode(args: &[Value]) -> Result<Value> {
    if args.len() != 1 {
        return Err(ExecutionError::FunctionError(
            "wrong number of arguments to 'html_encode'".to_string(),
        ));
    }

    Ok(Value::String(
        html_escape::encode_quoted_attribute(&args[0].to_string()).to_string(),
    ))
}

pub fn replace(args: &[Value]) -> Result<Value> {
    if args.len() < 3 || args.len() > 4 {
        return Err(ExecutionError::FunctionError(
            "wrong number of arguments to 'replace'".to_string(),
        ));
    }
    let haystack = args[0].to_string();
    let Value::String(needle) = &args[1] else {
        return Err(ExecutionError::FunctionError(
            "incorrect needle passed to 'replace'".to_string(),
        ));
    };
    let replacement = args[2].to_string();

    // count is optional, default to usize::MAX
    let count = match args.get(3) {
        Some(Value::Number(count)) if *count >= 0.0 => *count as usize,
        Some(_) => {
            return Err(ExecutionError::FunctionError(
                "incorrect type passed to 'replace'".to_string(),
            ));
        }
        None => usize::MAX,
    };
    Ok(Value::String(haystack.replacen(needle.as_str(), &replacement, count)))
}

pub fn set_redirect(args: &[Value]) -> Result<Value> {
    let Some(location) = args.first() else {
        return Err(ExecutionError::FunctionError(
            "wrong number of arguments to 'set_redirect'".to_string(),
        ));
    };
    info!("set_redirect: {}", location);
    Ok(Value::Null)
}

pub fn set_response_code(args: &[Value]) -> Result<Value> {
    match args.first() {
        Some(Value::Number(code)) => {
            info!("set_response_code: {}", code);
            Ok(Value::Null)
        }
        _ => Err(ExecutionError::FunctionError(
            "incorrect type passed to 'set_response_code'".to_string(),
        )),
    }
}

pub fn add_header(args: &[Value]) -> Result<Value> {
    if args.len() != 2 {
        return Err(ExecutionError::FunctionError(
            "wrong number of arguments to 'add_header'".to_string(),
        ));
    }
    info!("add_header: {}={}", args[0], args[1]);
    Ok(Value::Null)
}

pub fn add_cachebusting_header(_args: &[Value]) -> Result<Value> {
    info!("add_cachebusting_header");
    Ok(Value::Null)
}

/// Splits a `cc-ll` cookie value on `-` and returns the part at the given position.
pub fn get_country_language_from_cookie(args: &[Value]) -> Result<Value> {
    if args.len() < 2 {
        return Err(ExecutionError::FunctionError(
            "wrong number of arguments to 'getCountryLanguageFromCookie'".to_string(),
        ));
    }
    let value = args[0].to_string();
    let position = match &args[1] {
        Value::Number(n) if *n >= 0.0 => *n as usize,
        other => other.to_string().trim().parse::<usize>().map_err(|_| {
            ExecutionError::FunctionError(
                "incorrect position passed to 'getCountryLanguageFromCookie'".to_string(),
            )
        })?,
    };
    Ok(Value::String(
        value.split('-').nth(position).unwrap_or_default().to_string(),
    ))
}

/// Evaluates one argument of a built-in call.
pub fn evaluate_argument(arg: &str, ctx: &EvalContext) -> Value {
    let arg = arg.trim();
    if let Some(inner) = unquote(arg) {
        Value::String(inner.to_string())
    } else if arg.contains("$(") {
        Value::String(interpolate_vars(arg, ctx))
    } else {
        evaluate_expression(arg)
    }
}

/// Evaluates a `$name(args)` call to a built-in, `None` if `text` is not one.
pub fn call(text: &str, ctx: &EvalContext) -> Option<Result<Value>> {
    let text = text.trim();
    let after = text.strip_prefix('$')?;
    let open = after.find('(')?;
    let function = builtin(&after[..open])?;
    let args = after[open + 1..].strip_suffix(')')?;
    Some(function(&parse_arguments(args, ctx)))
}

fn parse_arguments(args: &str, ctx: &EvalContext) -> Vec<Value> {
    if args.trim().is_empty() {
        return Vec::new();
    }
    split_top_level(args, ',')
        .into_iter()
        .map(|arg| evaluate_argument(arg, ctx))
        .collect()
}

/// Rewrites every built-in call in an `<esi:vars>` body.
///
/// Calls returning a value are replaced by its string form; side-effect calls
/// are removed. A call that fails is logged and left as written.
pub fn rewrite_builtins(text: &str, ctx: &EvalContext) -> String {
    let mut output = String::with_capacity(text.len());
    let mut remaining = text;
    while let Some((start, open)) = find_call(remaining) {
        output.push_str(&remaining[..start]);
        let call_text = &remaining[start..];
        let Some(close) = find_closing(&call_text[open + 1..]) else {
            output.push_str(call_text);
            return output;
        };
        let end = open + 1 + close + 1;
        match call(&call_text[..end], ctx) {
            Some(Ok(value)) => output.push_str(&value.to_string()),
            Some(Err(err)) => {
                warn!("{}", err);
                output.push_str(&call_text[..end]);
            }
            None => output.push_str(&call_text[..end]),
        }
        remaining = &call_text[end..];
    }
    output.push_str(remaining);
    output
}

// Offset of the next `$name(` whose name is a known built-in, and of its `(` relative to it.
fn find_call(text: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    while let Some(pos) = text[offset..].find('$') {
        let start = offset + pos;
        let name_len = text[start + 1..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(text.len() - start - 1);
        let name = &text[start + 1..start + 1 + name_len];
        if builtin(name).is_some() && text[start + 1 + name_len..].starts_with('(') {
            return Some((start, name_len + 1));
        }
        offset = start + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower() {
        match lower(&[Value::String("HELLO".to_string())]) {
            Ok(value) => assert_eq!(value, Value::String("hello".to_string())),
            Err(err) => panic!("Unexpected error: {:?}", err),
        }
        match lower(&[Value::Number(123.0), Value::Number(456.0)]) {
            Ok(_) => panic!("Expected error, but got Ok"),
            Err(err) => assert_eq!(
                err.to_string(),
                ExecutionError::FunctionError("wrong number of arguments to 'lower'".to_string())
                    .to_string()
            ),
        }
    }

    #[test]
    fn test_html_encode() {
        match html_encode(&[Value::String("<b>".to_string())]) {
            Ok(value) => assert_eq!(value, Value::String("&lt;b&gt;".to_string())),
            Err(err) => panic!("Unexpected error: {:?}", err),
        }
        match html_encode(&[Value::String("a & \"b\" 'c'".to_string())]) {
            Ok(value) => assert_eq!(
                value,
                Value::String("a &amp; &quot;b&quot; &#x27;c&#x27;".to_string())
            ),
            Err(err) => panic!("Unexpected error: {:?}", err),
        }
        assert!(html_encode(&[]).is_err());
    }

    #[test]
    fn test_replace() {
        match replace(&[
            Value::from("hello world world"),
            Value::from("world"),
            Value::from("Rust"),
            Value::Number(1.0),
        ]) {
            Ok(value) => assert_eq!(value, Value::from("hello Rust world")),
            Err(err) => panic!("Unexpected error: {:?}", err),
        };
        match replace(&[
            Value::from("hello world world"),
            Value::from("world"),
            Value::from("Rust"),
        ]) {
            Ok(value) => assert_eq!(value, Value::from("hello Rust Rust")),
            Err(err) => panic!("Unexpected error: {:?}", err),
        };
        match replace(&[
            Value::from("hello world"),
            Value::from("world"),
            Value::from("Rust"),
            Value::from("not a number"),
        ]) {
            Ok(_) => panic!("Expected error, but got Ok"),
            Err(err) => assert_eq!(
                err.to_string(),
                ExecutionError::FunctionError("incorrect type passed to 'replace'".to_string())
                    .to_string()
            ),
        };
    }

    #[test]
    fn test_get_country_language_from_cookie() {
        let result = get_country_language_from_cookie(&[Value::from("de-en"), Value::Number(1.0)]);
        assert_eq!(result.ok(), Some(Value::from("en")));
        let result = get_country_language_from_cookie(&[Value::from("de-en"), Value::from("0")]);
        assert_eq!(result.ok(), Some(Value::from("de")));
        let result = get_country_language_from_cookie(&[Value::from("de"), Value::Number(3.0)]);
        assert_eq!(result.ok(), Some(Value::from("")));
        assert!(get_country_language_from_cookie(&[Value::from("de-en")]).is_err());
    }

    #[test]
    fn test_rewrite_html_encode_with_nested_reference() {
        let ctx = EvalContext::from([("name", Value::from("<b>"))]);
        assert_eq!(
            rewrite_builtins("x $html_encode($(name)) y", &ctx),
            "x &lt;b&gt; y"
        );
    }

    #[test]
    fn test_rewrite_removes_side_effect_calls() {
        let ctx = EvalContext::from([("loc", Value::from("/de/"))]);
        assert_eq!(
            rewrite_builtins(
                "a$set_redirect($(loc))b$set_response_code(301)c$add_header('x-a', 'b')d$add_cachebusting_header()e",
                &ctx
            ),
            "abcde"
        );
    }

    #[test]
    fn test_rewrite_leaves_failures_and_unknown_calls() {
        let ctx = EvalContext::new();
        assert_eq!(
            rewrite_builtins("$set_response_code('x') $(a) $unknown(1)", &ctx),
            "$set_response_code('x') $(a) $unknown(1)"
        );
        assert_eq!(rewrite_builtins("$lower('A'", &ctx), "$lower('A'");
    }

    #[test]
    fn test_call() {
        let ctx = EvalContext::from([("c", Value::from("ch-fr"))]);
        assert_eq!(
            call("$getCountryLanguageFromCookie($(c), 1)", &ctx).and_then(|r| r.ok()),
            Some(Value::from("fr"))
        );
        assert!(call("$nope(1)", &ctx).is_none());
        assert!(call("plain", &ctx).is_none());
    }
}
