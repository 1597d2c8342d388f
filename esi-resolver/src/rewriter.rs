use std::collections::HashMap;

use log::{trace, warn};

use crate::document::{Placeholder, Segment};
use crate::expression::{interpolate_vars, process_variables};
use crate::functions::rewrite_builtins;
use crate::parse::{DocumentParser, Element, Tag};
use crate::variables::{EvalContext, Value};
use crate::{ExecutionError, Result};

/// How passthrough text inside an element's content is treated when rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMode {
    Verbatim,
    /// Plain `$(name)` substitution.
    Interpolate,
    /// Built-in calls, then full `<esi:vars>` substitution.
    Vars,
}

impl TextMode {
    fn apply(self, text: &str, ctx: &EvalContext) -> String {
        match self {
            TextMode::Verbatim => text.to_string(),
            TextMode::Interpolate => process_variables(text, ctx),
            TextMode::Vars => interpolate_vars(&rewrite_builtins(text, ctx), ctx),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Action {
    Keep,
    Remove,
    KeepContent(Option<TextMode>),
    Replace(String),
    Repeat { item: String, values: Vec<String> },
}

/// The view of one element handed to an [`ElementHandler`].
///
/// An element the handler leaves untouched is kept as a [`Placeholder`] in the output.
pub struct ElementView<'t, 'a> {
    tag: &'t Tag<'a>,
    branch_taken: bool,
    action: Action,
}

impl<'t, 'a> ElementView<'t, 'a> {
    fn new(tag: &'t Tag<'a>, branch_taken: bool) -> Self {
        Self {
            tag,
            branch_taken,
            action: Action::Keep,
        }
    }

    pub fn name(&self) -> &'a str {
        self.tag.name
    }

    pub fn get_attribute(&self, name: &str) -> Option<&'a str> {
        self.tag.attribute(name)
    }

    pub fn required_attribute(&self, name: &str) -> Result<&'a str> {
        self.get_attribute(name).ok_or_else(|| {
            ExecutionError::MissingRequiredParameter(self.tag.name.to_string(), name.to_string())
        })
    }

    /// Raw markup between the start and end tags.
    pub fn inner_content(&self) -> Option<&'a str> {
        self.tag.content
    }

    pub fn remove(&mut self) {
        self.action = Action::Remove;
    }

    /// Drops the tags but renders the children in place.
    pub fn remove_and_keep_content(&mut self) {
        self.action = Action::KeepContent(None);
    }

    /// Like [`remove_and_keep_content`](Self::remove_and_keep_content), with text rendered
    /// in `mode`.
    pub fn keep_content_as(&mut self, mode: TextMode) {
        self.action = Action::KeepContent(Some(mode));
    }

    /// Replaces the element with `text`, which is emitted as markup without further processing.
    pub fn replace(&mut self, text: impl Into<String>) {
        self.action = Action::Replace(text.into());
    }

    /// Renders the children once per value, with `item` bound to the value.
    pub fn repeat_content(&mut self, item: impl Into<String>, values: Vec<String>) {
        self.action = Action::Repeat {
            item: item.into(),
            values,
        };
    }

    /// Whether an earlier sibling already took a conditional branch.
    pub fn branch_taken(&self) -> bool {
        self.branch_taken
    }

    pub fn take_branch(&mut self) {
        self.branch_taken = true;
    }
}

/// A handler invoked once for every element with the name it was registered for.
pub trait ElementHandler {
    fn element(&mut self, element: &mut ElementView<'_, '_>, ctx: &mut EvalContext) -> Result<()>;
}

impl<T: ElementHandler + ?Sized> ElementHandler for &mut T {
    fn element(&mut self, element: &mut ElementView<'_, '_>, ctx: &mut EvalContext) -> Result<()> {
        (**self).element(element, ctx)
    }
}

/// Runs registered handlers over a document in document order.
///
/// ## Usage Example
/// ```rust,no_run
/// use esi_resolver::{EvalContext, Rewriter};
/// use esi_resolver::resolvers::{AssignResolver, VarsResolver};
///
/// let mut ctx = EvalContext::new();
/// let segments = Rewriter::new("esi")
///     .on("assign", AssignResolver)
///     .on("vars", VarsResolver)
///     .transform(r#"<esi:assign name="a" value="'b'"/><esi:vars>$(a)</esi:vars>"#, &mut ctx);
/// ```
pub struct Rewriter<'h> {
    parser: DocumentParser,
    handlers: HashMap<String, Box<dyn ElementHandler + 'h>>,
    loop_depth: usize,
}

impl<'h> Rewriter<'h> {
    pub fn new(namespace: &str) -> Self {
        Self {
            parser: DocumentParser::new(namespace),
            handlers: HashMap::new(),
            loop_depth: 0,
        }
    }

    pub fn on(mut self, name: &str, handler: impl ElementHandler + 'h) -> Self {
        self.handlers.insert(name.to_string(), Box::new(handler));
        self
    }

    /// Elements without a handler are passed through untouched.
    pub fn transform(&mut self, document: &str, ctx: &mut EvalContext) -> Vec<Segment> {
        let elements = self.parser.parse(document);
        let mut output = Vec::new();
        self.render(&elements, ctx, TextMode::Verbatim, &mut output);
        output
    }

    fn render(
        &mut self,
        elements: &[Element<'_>],
        ctx: &mut EvalContext,
        mode: TextMode,
        output: &mut Vec<Segment>,
    ) {
        let mut branch_taken = false;
        for element in elements {
            if self.loop_depth > 0 && ctx.is_break() {
                return;
            }
            match element {
                Element::Raw(text) => push_text(output, mode.apply(text, ctx)),
                Element::Esi(tag) => self.dispatch(tag, ctx, mode, &mut branch_taken, output),
            }
        }
    }

    fn dispatch(
        &mut self,
        tag: &Tag<'_>,
        ctx: &mut EvalContext,
        mode: TextMode,
        branch_taken: &mut bool,
        output: &mut Vec<Segment>,
    ) {
        let Some(handler) = self.handlers.get_mut(tag.name) else {
            trace!("no handler for `{}`, passing through", tag.name);
            push_text(output, tag.markup.to_string());
            return;
        };

        let mut view = ElementView::new(tag, *branch_taken);
        if let Err(err) = handler.element(&mut view, ctx) {
            warn!("removing `{}`: {}", tag.name, err);
            return;
        }
        *branch_taken = view.branch_taken;

        match view.action {
            Action::Keep => output.push(Segment::Element(Placeholder::from(tag))),
            Action::Remove => {}
            Action::KeepContent(content_mode) => {
                self.render(&tag.children, ctx, content_mode.unwrap_or(mode), output)
            }
            Action::Replace(text) => push_text(output, text),
            Action::Repeat { item, values } => {
                ctx.clear_break();
                self.loop_depth += 1;
                for value in values {
                    if ctx.is_break() {
                        break;
                    }
                    ctx.set_variable(&item, Value::String(value));
                    self.render(&tag.children, ctx, TextMode::Interpolate, output);
                }
                self.loop_depth -= 1;
                ctx.clear_break();
            }
        }
    }
}

fn push_text(output: &mut Vec<Segment>, text: String) {
    if text.is_empty() {
        return;
    }
    match output.last_mut() {
        Some(Segment::Raw(last)) => last.push_str(&text),
        _ => output.push(Segment::Raw(text)),
    }
}
