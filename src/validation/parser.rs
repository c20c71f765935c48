//! Structural parser for handler source.
//!
//! Handlers are written in an indentation-scoped scripting language. The
//! parser does not build a full syntax tree; it splits the source into
//! logical lines, checks that strings, brackets and indentation are well
//! formed, and extracts the function definitions and imports the rule set
//! needs.

use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// One statement after joining bracket and backslash continuations.
#[derive(Debug, Clone)]
pub struct LogicalLine {
    /// 1-based physical line the statement starts on.
    pub number: usize,
    pub indent: usize,
    /// Statement text with comments removed.
    pub code: String,
    /// Same text with string literal contents blanked out.
    pub masked: String,
}

impl LogicalLine {
    pub fn opens_block(&self) -> bool {
        self.masked.trim_end().ends_with(':')
    }
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub is_async: bool,
    /// Declared parameters, without the receiver.
    pub params: Vec<String>,
    pub has_return_annotation: bool,
    pub line: usize,
    /// Index of the header in `ParsedSource::lines`.
    pub header: usize,
    /// Header text after the colon, for single-line definitions.
    pub inline_body: String,
    /// Indexes of the body statements in `ParsedSource::lines`.
    pub body: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// Top-level package name.
    pub module: String,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub lines: Vec<LogicalLine>,
    pub functions: Vec<FunctionDef>,
    pub imports: Vec<Import>,
}

impl ParsedSource {
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn has_exception_handling(&self) -> bool {
        self.lines.iter().any(|l| {
            let text = l.masked.trim_start();
            text.strip_prefix("try")
                .is_some_and(|rest| rest.trim_start().starts_with(':'))
        })
    }

    /// Masked text of a function's header tail and body statements.
    pub fn function_text<'a>(&'a self, function: &'a FunctionDef) -> Vec<&'a str> {
        let mut text = vec![function.inline_body.as_str()];
        text.extend(self.lines[function.body.clone()].iter().map(|l| l.masked.as_str()));
        text
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenString {
    quote: char,
    triple: bool,
    line: usize,
}

pub fn parse(source: &str) -> Result<ParsedSource, ParseError> {
    let lines = split_logical_lines(source)?;
    check_indentation(&lines)?;
    let functions = extract_functions(&lines)?;
    let imports = extract_imports(&lines);

    Ok(ParsedSource {
        lines,
        functions,
        imports,
    })
}

fn indent_width(line: &str, number: usize) -> Result<usize, ParseError> {
    let leading: String = line.chars().take_while(|c| *c == ' ' || *c == '\t').collect();
    if leading.contains(' ') && leading.contains('\t') {
        return Err(ParseError::new(number, "inconsistent use of tabs and spaces in indentation"));
    }
    Ok(leading.chars().map(|c| if c == '\t' { 8 } else { 1 }).sum())
}

fn split_logical_lines(source: &str) -> Result<Vec<LogicalLine>, ParseError> {
    let mut lines = Vec::new();
    let mut pending: Option<LogicalLine> = None;
    let mut open_string: Option<OpenString> = None;
    let mut brackets: Vec<(char, usize)> = Vec::new();

    for (index, raw) in source.lines().enumerate() {
        let number = index + 1;

        if pending.is_none() {
            let stripped = raw.trim_start();
            if stripped.is_empty() || stripped.starts_with('#') {
                continue;
            }
            pending = Some(LogicalLine {
                number,
                indent: indent_width(raw, number)?,
                code: String::new(),
                masked: String::new(),
            });
        }
        let Some(current) = pending.as_mut() else {
            continue;
        };

        let chars: Vec<char> = raw.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let ch = chars[i];

            if let Some(open) = open_string {
                if ch == '\\' {
                    current.code.push(ch);
                    if let Some(next) = chars.get(i + 1) {
                        current.code.push(*next);
                    }
                    i += 2;
                    continue;
                }
                if ch == open.quote {
                    if !open.triple {
                        open_string = None;
                        current.code.push(ch);
                        current.masked.push(ch);
                        i += 1;
                        continue;
                    }
                    if chars.get(i + 1) == Some(&ch) && chars.get(i + 2) == Some(&ch) {
                        open_string = None;
                        for _ in 0..3 {
                            current.code.push(ch);
                            current.masked.push(ch);
                        }
                        i += 3;
                        continue;
                    }
                }
                current.code.push(ch);
                i += 1;
                continue;
            }

            match ch {
                '#' => break,
                '\'' | '"' => {
                    let triple = chars.get(i + 1) == Some(&ch) && chars.get(i + 2) == Some(&ch);
                    let width = if triple { 3 } else { 1 };
                    for _ in 0..width {
                        current.code.push(ch);
                        current.masked.push(ch);
                    }
                    open_string = Some(OpenString {
                        quote: ch,
                        triple,
                        line: number,
                    });
                    i += width;
                    continue;
                }
                '(' | '[' | '{' => brackets.push((ch, number)),
                ')' | ']' | '}' => {
                    let expected = match ch {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match brackets.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, line)) => {
                            return Err(ParseError::new(
                                number,
                                format!(
                                    "closing '{}' does not match '{}' opened on line {}",
                                    ch, open, line
                                ),
                            ));
                        }
                        None => {
                            return Err(ParseError::new(number, format!("unmatched '{}'", ch)));
                        }
                    }
                }
                _ => {}
            }
            current.code.push(ch);
            current.masked.push(ch);
            i += 1;
        }

        if let Some(open) = open_string {
            if !open.triple {
                return Err(ParseError::new(open.line, "unterminated string literal"));
            }
        }

        let continued = if open_string.is_none() && current.code.trim_end().ends_with('\\') {
            let trimmed = current.code.trim_end().trim_end_matches('\\').to_string();
            current.code = trimmed;
            let trimmed = current.masked.trim_end().trim_end_matches('\\').to_string();
            current.masked = trimmed;
            true
        } else {
            false
        };

        if continued || open_string.is_some() || !brackets.is_empty() {
            current.code.push('\n');
            current.masked.push(' ');
            continue;
        }

        if let Some(done) = pending.take() {
            lines.push(done);
        }
    }

    if let Some(open) = open_string {
        return Err(ParseError::new(open.line, "unterminated triple-quoted string literal"));
    }
    if let Some((open, line)) = brackets.first() {
        return Err(ParseError::new(*line, format!("'{}' was never closed", open)));
    }
    if let Some(done) = pending {
        // A trailing backslash on the final line.
        return Err(ParseError::new(done.number, "unexpected end of input after line continuation"));
    }

    Ok(lines)
}

fn check_indentation(lines: &[LogicalLine]) -> Result<(), ParseError> {
    let mut levels = vec![0usize];
    let mut expect_block: Option<usize> = None;

    for line in lines {
        let top = *levels.last().unwrap_or(&0);

        if let Some(header) = expect_block.take() {
            if line.indent <= top {
                return Err(ParseError::new(
                    line.number,
                    format!("expected an indented block after line {}", header),
                ));
            }
            levels.push(line.indent);
        } else if line.indent > top {
            return Err(ParseError::new(line.number, "unexpected indent"));
        } else {
            while line.indent < *levels.last().unwrap_or(&0) {
                levels.pop();
            }
            if line.indent != *levels.last().unwrap_or(&0) {
                return Err(ParseError::new(
                    line.number,
                    "unindent does not match any outer indentation level",
                ));
            }
        }

        if line.opens_block() {
            expect_block = Some(line.number);
        }
    }

    if let Some(header) = expect_block {
        return Err(ParseError::new(
            header,
            "expected an indented block before end of input",
        ));
    }
    Ok(())
}

/// Returns the index of the bracket closing the one at `open`.
fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, ch) in chars[open..].iter().enumerate() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in text.chars() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    parts.push(current);
    parts
}

fn parameter_names(text: &str) -> Vec<String> {
    split_top_level(text)
        .into_iter()
        .filter_map(|raw| {
            let name = raw
                .split([':', '='])
                .next()
                .unwrap_or("")
                .trim()
                .trim_start_matches('*')
                .trim()
                .to_string();
            match name.as_str() {
                "" | "/" | "self" | "cls" => None,
                _ => Some(name),
            }
        })
        .collect()
}

fn parse_function_header(
    line: &LogicalLine,
    header: usize,
) -> Result<Option<FunctionDef>, ParseError> {
    let text = line.masked.trim_start();
    let (is_async, rest) = match text.strip_prefix("async") {
        Some(rest) if rest.starts_with(char::is_whitespace) => (true, rest.trim_start()),
        _ => (false, text),
    };
    let Some(rest) = rest.strip_prefix("def") else {
        return Ok(None);
    };
    if !rest.starts_with(char::is_whitespace) {
        return Ok(None);
    }

    let invalid = || ParseError::new(line.number, "invalid function definition");
    let rest = rest.trim_start();
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let chars: Vec<char> = rest[name.len()..].chars().collect();
    let open = chars
        .iter()
        .position(|c| !c.is_whitespace())
        .filter(|i| chars[*i] == '(')
        .ok_or_else(invalid)?;
    let close = matching_paren(&chars, open).ok_or_else(invalid)?;
    let params: String = chars[open + 1..close].iter().collect();
    let tail: String = chars[close + 1..].iter().collect();
    let tail = tail.trim_start();

    let (has_return_annotation, after_annotation) = match tail.strip_prefix("->") {
        Some(annotation) => {
            let colon = annotation.find(':').ok_or_else(invalid)?;
            if annotation[..colon].trim().is_empty() {
                return Err(invalid());
            }
            (true, &annotation[colon..])
        }
        None => (false, tail),
    };
    let inline_body = after_annotation
        .strip_prefix(':')
        .ok_or_else(invalid)?
        .trim()
        .to_string();

    Ok(Some(FunctionDef {
        name,
        is_async,
        params: parameter_names(&params),
        has_return_annotation,
        line: line.number,
        header,
        inline_body,
        body: header + 1..header + 1,
    }))
}

fn extract_functions(lines: &[LogicalLine]) -> Result<Vec<FunctionDef>, ParseError> {
    let mut functions = Vec::new();
    for (index, line) in lines.iter().enumerate() {
        if let Some(mut function) = parse_function_header(line, index)? {
            let end = lines[index + 1..]
                .iter()
                .position(|l| l.indent <= line.indent)
                .map_or(lines.len(), |offset| index + 1 + offset);
            function.body = index + 1..end;
            functions.push(function);
        }
    }
    Ok(functions)
}

fn extract_imports(lines: &[LogicalLine]) -> Vec<Import> {
    let mut imports = Vec::new();
    for line in lines {
        let text = line.masked.trim();
        if let Some(rest) = text.strip_prefix("import ") {
            for item in rest.split(',') {
                let module = item.split(" as ").next().unwrap_or("").trim();
                let root = module.split('.').next().unwrap_or("").trim();
                if !root.is_empty() {
                    imports.push(Import {
                        module: root.to_string(),
                        line: line.number,
                    });
                }
            }
        } else if let Some(rest) = text.strip_prefix("from ") {
            let module = rest.split_whitespace().next().unwrap_or("");
            // Relative imports stay inside the handler package.
            if module.starts_with('.') || module.is_empty() {
                continue;
            }
            let root = module.split('.').next().unwrap_or("");
            imports.push(Import {
                module: root.to_string(),
                line: line.number,
            });
        }
    }
    imports
}
