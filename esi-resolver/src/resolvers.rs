//! One [`ElementHandler`] per ESI tag kind evaluated during the scan pass.
//!
//! `<esi:include>` is handled separately, by the include scanner and replacer.

use std::collections::BTreeSet;

use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::expression::{
    evaluate_collection, evaluate_expression, evaluate_when_condition, interpolate_vars,
    parse_assignment, process_variables,
};
use crate::functions::{call, rewrite_builtins};
use crate::rewriter::{ElementHandler, ElementView, TextMode};
use crate::variables::{EvalContext, FunctionDef, Value};
use crate::Result;

static FUNCTION_ARGUMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"ARGS\{(\d+)\}").unwrap());

/// Tags that are dropped along with their content.
pub const DELETED_TAGS: [&str; 6] = ["comment", "remove", "try", "attempt", "except", "eval"];

/// `<esi:assign name="..." value="..."/>`, or the long form with the value as content.
pub struct AssignResolver;

impl ElementHandler for AssignResolver {
    fn element(&mut self, element: &mut ElementView<'_, '_>, ctx: &mut EvalContext) -> Result<()> {
        let name = element.required_attribute("name")?;
        let value = match element.get_attribute("value") {
            Some(value) => value,
            None => element.inner_content().unwrap_or_default().trim(),
        };
        let value = parse_assignment(value).evaluate(ctx);
        trace!("assign {} = {:?}", name, value);
        ctx.set_variable(name, value);
        element.remove();
        Ok(())
    }
}

/// `<esi:vars>`: substitutes variables and built-in calls in its content.
pub struct VarsResolver;

impl ElementHandler for VarsResolver {
    fn element(&mut self, element: &mut ElementView<'_, '_>, ctx: &mut EvalContext) -> Result<()> {
        if let Some(content) = element.get_attribute("content") {
            let rendered = interpolate_vars(&rewrite_builtins(content, ctx), ctx);
            element.replace(rendered);
        } else if element.inner_content().is_some_and(|c| !c.is_empty()) {
            element.keep_content_as(TextMode::Vars);
        } else {
            element.remove();
        }
        Ok(())
    }
}

/// `<esi:choose>` only groups its branches.
pub struct ChooseResolver;

impl ElementHandler for ChooseResolver {
    fn element(&mut self, element: &mut ElementView<'_, '_>, _ctx: &mut EvalContext) -> Result<()> {
        element.remove_and_keep_content();
        Ok(())
    }
}

/// `<esi:when test="...">`: rendered if its test holds and no earlier branch was taken.
pub struct WhenResolver;

impl ElementHandler for WhenResolver {
    fn element(&mut self, element: &mut ElementView<'_, '_>, ctx: &mut EvalContext) -> Result<()> {
        let test = element.get_attribute("test").unwrap_or_default();
        if !element.branch_taken() && evaluate_when_condition(test, ctx) {
            debug!("when `{}` matched", test);
            element.take_branch();
            element.remove_and_keep_content();
        } else {
            element.remove();
        }
        Ok(())
    }
}

pub struct OtherwiseResolver;

impl ElementHandler for OtherwiseResolver {
    fn element(&mut self, element: &mut ElementView<'_, '_>, _ctx: &mut EvalContext) -> Result<()> {
        if element.branch_taken() {
            element.remove();
        } else {
            element.take_branch();
            element.remove_and_keep_content();
        }
        Ok(())
    }
}

/// `<esi:foreach collection="..." item="...">`
pub struct ForeachResolver;

impl ElementHandler for ForeachResolver {
    fn element(&mut self, element: &mut ElementView<'_, '_>, ctx: &mut EvalContext) -> Result<()> {
        let collection = element.get_attribute("collection").unwrap_or_default();
        let item = element.get_attribute("item").unwrap_or("item");
        let values = evaluate_collection(collection, ctx);
        if values.is_empty() {
            debug!("empty collection `{}`", collection);
            element.remove();
        } else {
            element.repeat_content(item, values);
        }
        Ok(())
    }
}

pub struct BreakResolver;

impl ElementHandler for BreakResolver {
    fn element(&mut self, element: &mut ElementView<'_, '_>, ctx: &mut EvalContext) -> Result<()> {
        ctx.set_break();
        element.remove();
        Ok(())
    }
}

/// `<esi:function name="...">`: stores the body for later calls; nothing is executed.
pub struct FunctionResolver;

impl ElementHandler for FunctionResolver {
    fn element(&mut self, element: &mut ElementView<'_, '_>, ctx: &mut EvalContext) -> Result<()> {
        let name = element.required_attribute("name")?;
        let body = element.inner_content().unwrap_or_default();
        let parameters: BTreeSet<usize> = FUNCTION_ARGUMENT
            .captures_iter(body)
            .filter_map(|caps| caps[1].parse().ok())
            .collect();
        debug!("defined function {} with arguments {:?}", name, parameters);
        ctx.set_function(
            name,
            FunctionDef {
                name: name.to_string(),
                body: body.to_string(),
                parameters: parameters.into_iter().collect(),
            },
        );
        element.remove();
        Ok(())
    }
}

/// `<esi:return value="..."/>`
pub struct ReturnResolver;

impl ElementHandler for ReturnResolver {
    fn element(&mut self, element: &mut ElementView<'_, '_>, ctx: &mut EvalContext) -> Result<()> {
        let value = element.get_attribute("value").unwrap_or_default();
        let value = match call(value, ctx) {
            Some(result) => result?,
            None if value.contains("$(") => Value::String(process_variables(value, ctx)),
            None => evaluate_expression(value),
        };
        ctx.set_return(value);
        element.remove();
        Ok(())
    }
}

/// `<esi:text>`: content is emitted exactly as written.
pub struct TextResolver;

impl ElementHandler for TextResolver {
    fn element(&mut self, element: &mut ElementView<'_, '_>, _ctx: &mut EvalContext) -> Result<()> {
        let content = element.inner_content().unwrap_or_default();
        element.replace(content);
        Ok(())
    }
}

/// Removes the element and everything inside it.
pub struct DeleteResolver;

impl ElementHandler for DeleteResolver {
    fn element(&mut self, element: &mut ElementView<'_, '_>, _ctx: &mut EvalContext) -> Result<()> {
        trace!("deleting `{}`", element.name());
        element.remove();
        Ok(())
    }
}
