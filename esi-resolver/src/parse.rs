use std::collections::HashSet;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_till, take_while1};
use nom::character::complete::{char, multispace0, multispace1};
use nom::combinator::value;
use nom::error::Error;
use nom::multi::many0;
use nom::sequence::{delimited, preceded, separated_pair, tuple};
use nom::IResult;

/// A section of a document: passthrough markup or an ESI element.
///
/// Concatenating the source slices of all elements reproduces the input exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum Element<'a> {
    Raw(&'a str),
    Esi(Tag<'a>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag<'a> {
    /// Local name without the namespace, e.g. `include`.
    pub name: &'a str,
    pub attributes: Vec<(&'a str, &'a str)>,
    /// The element's full source, start tag to end tag.
    pub markup: &'a str,
    /// Raw markup between the start and end tags; `None` when self-closing or unclosed.
    pub content: Option<&'a str>,
    pub children: Vec<Element<'a>>,
}

impl<'a> Tag<'a> {
    pub fn attribute(&self, name: &str) -> Option<&'a str> {
        self.attributes
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
    }
}

/// Splits documents into ESI elements of one namespace and passthrough markup.
#[derive(Debug, Clone)]
pub struct DocumentParser {
    open: String,
    close: String,
}

impl DocumentParser {
    pub fn new(namespace: &str) -> Self {
        Self {
            open: format!("<{namespace}:"),
            close: format!("</{namespace}:"),
        }
    }

    /// Never fails: anything that does not parse as an ESI element is kept as raw markup.
    pub fn parse<'a>(&self, input: &'a str) -> Vec<Element<'a>> {
        let mut scan = Scan {
            parser: self,
            source: input,
            unclosed: HashSet::new(),
        };
        scan.content(0, None)
            .map(|(elements, _)| elements)
            .unwrap_or_else(|| vec![Element::Raw(input)])
    }

    #[allow(clippy::type_complexity)]
    fn start_tag<'a>(
        &self,
        input: &'a str,
    ) -> IResult<&'a str, (&'a str, Vec<(&'a str, &'a str)>, bool), Error<&'a str>> {
        tuple((
            preceded(tag(self.open.as_str()), tag_name),
            attributes,
            preceded(
                multispace0,
                alt((value(true, tag("/>")), value(false, char('>')))),
            ),
        ))(input)
    }
}

// One parse over `source`. Offsets are absolute.
struct Scan<'p, 'a> {
    parser: &'p DocumentParser,
    source: &'a str,
    // Body offsets, by tag name, already known to have no end tag.
    unclosed: HashSet<(usize, &'a str)>,
}

impl<'a> Scan<'_, 'a> {
    // Returns the elements and the offset at which `closing` starts. Without
    // `closing` the rest of the input is consumed; with it, `None` means it never appeared.
    fn content(
        &mut self,
        from: usize,
        closing: Option<&str>,
    ) -> Option<(Vec<Element<'a>>, usize)> {
        let input = self.source;
        let mut elements = Vec::new();
        let mut raw_start = from;
        let mut pos = from;
        loop {
            let rest = &input[pos..];
            let next_open = rest.find(self.parser.open.as_str());
            let next_close = closing.and_then(|c| rest.find(c));
            match (next_open, next_close) {
                (_, Some(close)) if next_open.map_or(true, |open| close < open) => {
                    let at = pos + close;
                    if let Some(closing) = closing {
                        if end_tag(closing)(&input[at..]).is_ok() {
                            push_raw(&mut elements, &input[raw_start..at]);
                            return Some((elements, at));
                        }
                    }
                    pos = at + 1;
                }
                (Some(open), _) => {
                    let at = pos + open;
                    match self.element(at) {
                        Some((tag, end)) => {
                            push_raw(&mut elements, &input[raw_start..at]);
                            elements.push(Element::Esi(tag));
                            pos = end;
                            raw_start = end;
                        }
                        None => pos = at + 1,
                    }
                }
                (None, _) => {
                    if closing.is_some() {
                        return None;
                    }
                    push_raw(&mut elements, &input[raw_start..]);
                    return Some((elements, input.len()));
                }
            }
        }
    }

    // The element starting at `at` and the offset just past it.
    fn element(&mut self, at: usize) -> Option<(Tag<'a>, usize)> {
        let input = self.source;
        let (after_start, (name, attributes, self_closing)) =
            self.parser.start_tag(&input[at..]).ok()?;
        let body_start = input.len() - after_start.len();
        let mut tag = Tag {
            name,
            attributes,
            markup: &input[at..body_start],
            content: None,
            children: Vec::new(),
        };
        if self_closing || self.unclosed.contains(&(body_start, name)) {
            return Some((tag, body_start));
        }

        let closing = format!("{}{}", self.parser.close, name);
        // `text` content is never interpreted, so nested tags are not looked for.
        let body = if name == "text" {
            find_end_tag(after_start, &closing).map(|end| (Vec::new(), body_start + end))
        } else {
            self.content(body_start, Some(&closing))
        };

        match body {
            Some((children, end)) => {
                let (remaining, _) = end_tag(&closing)(&input[end..]).ok()?;
                let tag_end = input.len() - remaining.len();
                tag.markup = &input[at..tag_end];
                tag.content = Some(&input[body_start..end]);
                tag.children = children;
                Some((tag, tag_end))
            }
            // Unclosed: the start tag stands alone.
            None => {
                self.unclosed.insert((body_start, name));
                Some((tag, body_start))
            }
        }
    }
}

fn push_raw<'a>(elements: &mut Vec<Element<'a>>, raw: &'a str) {
    if !raw.is_empty() {
        elements.push(Element::Raw(raw));
    }
}

fn find_end_tag(input: &str, closing: &str) -> Option<usize> {
    let mut pos = 0;
    while let Some(found) = input[pos..].find(closing) {
        let at = pos + found;
        if end_tag(closing)(&input[at..]).is_ok() {
            return Some(at);
        }
        pos = at + 1;
    }
    None
}

fn end_tag<'a, 'b>(
    closing: &'b str,
) -> impl Fn(&'a str) -> IResult<&'a str, (), Error<&'a str>> + 'b {
    move |input: &'a str| value((), tuple((tag(closing), multispace0, char('>'))))(input)
}

fn tag_name(input: &str) -> IResult<&str, &str, Error<&str>> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')(input)
}

fn attribute_name(input: &str) -> IResult<&str, &str, Error<&str>> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':'))(input)
}

fn attribute_value(input: &str) -> IResult<&str, &str, Error<&str>> {
    alt((
        delimited(char('"'), take_till(|c| c == '"'), char('"')),
        delimited(char('\''), take_till(|c| c == '\''), char('\'')),
    ))(input)
}

fn attributes(input: &str) -> IResult<&str, Vec<(&str, &str)>, Error<&str>> {
    many0(preceded(
        multispace1,
        separated_pair(
            attribute_name,
            delimited(multispace0, char('='), multispace0),
            attribute_value,
        ),
    ))(input)
}
