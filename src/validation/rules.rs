use once_cell::sync::Lazy;
use regex::Regex;

use super::parser::{FunctionDef, ParsedSource};
use super::ValidationSettings;
use crate::types::{IssueCategory, Severity, Strictness, ValidationIssue};

/// Which rendition of a logical line a pattern is matched against.
#[derive(Debug, Clone, Copy)]
enum Scan {
    /// String contents blanked, so literals cannot trigger the rule.
    Masked,
    /// Comments removed, string contents kept.
    Code,
}

struct PatternRule {
    regex: Regex,
    scan: Scan,
    code: &'static str,
    message: &'static str,
    suggestion: &'static str,
}

impl PatternRule {
    fn new(
        pattern: &str,
        scan: Scan,
        code: &'static str,
        message: &'static str,
        suggestion: &'static str,
    ) -> Self {
        Self {
            regex: Regex::new(pattern).expect("built-in validation pattern must compile"),
            scan,
            code,
            message,
            suggestion,
        }
    }

    fn matches(&self, code: &str, masked: &str) -> bool {
        match self.scan {
            Scan::Masked => self.regex.is_match(masked),
            Scan::Code => self.regex.is_match(code),
        }
    }
}

static DANGEROUS_PATTERNS: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    vec![
        PatternRule::new(
            r"\beval\s*\(",
            Scan::Masked,
            "dynamic-eval",
            "Dynamic evaluation with eval() is not allowed",
            "Parse structured input explicitly instead of evaluating it",
        ),
        PatternRule::new(
            r"\bexec\s*\(",
            Scan::Masked,
            "dynamic-exec",
            "Dynamic execution with exec() is not allowed",
            "Express the logic directly in the handler",
        ),
        PatternRule::new(
            r"\bcompile\s*\(",
            Scan::Masked,
            "dynamic-compile",
            "Compiling code at runtime is not allowed",
            "Express the logic directly in the handler",
        ),
        PatternRule::new(
            r"__import__\s*\(|\bimportlib\.",
            Scan::Masked,
            "dynamic-import",
            "Dynamic imports are not allowed",
            "Use a static import from the allow-list",
        ),
        PatternRule::new(
            r"\bos\.(system|popen|fork|kill|remove|unlink|rmdir|removedirs|exec\w*|spawn\w*)\s*\(",
            Scan::Masked,
            "os-primitive",
            "Direct process or filesystem access through os is not allowed",
            "Use the capabilities exposed by the handler context",
        ),
        PatternRule::new(
            r"\bsubprocess\.",
            Scan::Masked,
            "subprocess",
            "Spawning subprocesses is not allowed",
            "Use the capabilities exposed by the handler context",
        ),
        PatternRule::new(
            r"\bshutil\.(rmtree|move|copy\w*)\s*\(",
            Scan::Masked,
            "file-primitive",
            "Filesystem manipulation through shutil is not allowed",
            "Use the storage capability exposed by the handler context",
        ),
        PatternRule::new(
            r"(^|[^.\w])open\s*\(",
            Scan::Masked,
            "file-open",
            "Opening files directly is not allowed",
            "Use the storage capability exposed by the handler context",
        ),
        PatternRule::new(
            r"\bsocket\.(socket|create_connection)\s*\(",
            Scan::Masked,
            "raw-socket",
            "Raw network sockets are not allowed",
            "Use the HTTP capability exposed by the handler context",
        ),
        PatternRule::new(
            r"\b(getattr|setattr|delattr)\s*\(",
            Scan::Masked,
            "reflection",
            "Reflective attribute access is not allowed",
            "Access attributes explicitly",
        ),
        PatternRule::new(
            r"\b(globals|locals|vars)\s*\(|__(globals|builtins|dict|class|subclasses|code|bases|mro)__",
            Scan::Masked,
            "introspection",
            "Interpreter introspection is not allowed",
            "Access data through explicit parameters",
        ),
        PatternRule::new(
            r"\b(pickle|marshal|shelve)\.",
            Scan::Masked,
            "unsafe-deserialization",
            "Native object deserialization is not allowed",
            "Use json for serialization",
        ),
        PatternRule::new(
            r"(?i)\b(drop\s+(table|database|schema)|delete\s+from|truncate\s+table|alter\s+table|insert\s+into|update\s+\w+\s+set)\b",
            Scan::Code,
            "raw-sql-mutation",
            "Raw SQL mutation statement found",
            "Use the parameterized data access layer",
        ),
    ]
});

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b\w*(password|passwd|secret|api_?key|access_?key|private_?key|auth_?token|token)\w*\s*=\s*[rbf]?["'][^"'\s]{6,}["']"#,
    )
    .expect("secret pattern must compile")
});

static PERFORMANCE_PATTERNS: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    vec![
        PatternRule::new(
            r"\btime\.sleep\s*\(",
            Scan::Masked,
            "blocking-sleep",
            "Blocking sleep stalls the event loop",
            "Use asyncio.sleep() instead",
        ),
        PatternRule::new(
            r"^\s*while\s+(True|1)\s*:",
            Scan::Masked,
            "infinite-loop",
            "Unconditional infinite loop",
            "Bound the loop with a condition or an iteration limit",
        ),
        PatternRule::new(
            r"\brequests\.(get|post|put|patch|delete|head|request)\s*\(|\burllib\.request\.urlopen\s*\(",
            Scan::Masked,
            "blocking-network",
            "Blocking network call in an async handler",
            "Use an async HTTP client such as aiohttp or httpx",
        ),
    ]
});

static RANGE_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\brange\s*\(([^)]*)\)").expect("range pattern must compile"));

static BRANCH_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(if|elif|for|while|except|and|or)\b").expect("branch pattern must compile")
});

const LARGE_RANGE: u64 = 1_000_000;

/// Modules handlers may import under strict validation, by category.
pub const IMPORT_ALLOW_LIST: &[(&str, &[&str])] = &[
    (
        "core",
        &[
            "asyncio", "json", "datetime", "time", "typing", "dataclasses", "enum",
            "collections", "functools", "itertools", "math", "re", "uuid", "logging",
            "decimal", "copy", "abc",
        ],
    ),
    ("data", &["pandas", "numpy", "csv", "statistics"]),
    ("web", &["aiohttp", "httpx", "requests", "urllib"]),
    ("ai", &["openai", "anthropic", "langchain", "tiktoken"]),
    ("database", &["sqlalchemy", "asyncpg", "redis", "motor"]),
    (
        "utility",
        &["pydantic", "hashlib", "base64", "hmac", "secrets", "string", "textwrap"],
    ),
];

pub fn import_category(module: &str) -> Option<&'static str> {
    IMPORT_ALLOW_LIST
        .iter()
        .find(|(_, modules)| modules.contains(&module))
        .map(|(category, _)| *category)
}

pub fn check_security(parsed: &ParsedSource, strictness: Strictness) -> Vec<ValidationIssue> {
    let severity = if strictness.is_elevated() {
        Severity::Error
    } else {
        Severity::Warning
    };
    let mut issues = Vec::new();

    for line in &parsed.lines {
        for rule in DANGEROUS_PATTERNS.iter() {
            if rule.matches(&line.code, &line.masked) {
                issues.push(
                    ValidationIssue::new(severity, IssueCategory::Security, rule.code, rule.message)
                        .at_line(line.number)
                        .with_suggestion(rule.suggestion),
                );
            }
        }

        if SECRET_PATTERN.is_match(&line.code) {
            issues.push(
                ValidationIssue::new(
                    severity,
                    IssueCategory::Security,
                    "hardcoded-secret",
                    "Probable hard-coded credential",
                )
                .at_line(line.number)
                .with_suggestion("Read credentials from the handler configuration"),
            );
        }
    }

    if strictness.is_elevated() {
        for import in &parsed.imports {
            if import_category(&import.module).is_none() {
                issues.push(
                    ValidationIssue::new(
                        Severity::Error,
                        IssueCategory::Security,
                        "disallowed-import",
                        format!("Import of '{}' is not on the allow-list", import.module),
                    )
                    .at_line(import.line)
                    .with_suggestion("Restrict imports to the approved modules"),
                );
            }
        }
    }

    issues
}

fn has_large_range(masked: &str) -> bool {
    RANGE_CALL.captures_iter(masked).any(|caps| {
        caps[1].split(',').any(|arg| {
            arg.trim()
                .replace('_', "")
                .parse::<u64>()
                .is_ok_and(|n| n >= LARGE_RANGE)
        })
    })
}

/// Branches plus boolean operators plus one.
pub fn cyclomatic_complexity(parsed: &ParsedSource, function: &FunctionDef) -> usize {
    parsed
        .function_text(function)
        .iter()
        .map(|text| BRANCH_KEYWORD.find_iter(text).count())
        .sum::<usize>()
        + 1
}

pub fn check_performance(
    parsed: &ParsedSource,
    settings: &ValidationSettings,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    for line in &parsed.lines {
        for rule in PERFORMANCE_PATTERNS.iter() {
            if rule.matches(&line.code, &line.masked) {
                issues.push(
                    ValidationIssue::new(
                        Severity::Warning,
                        IssueCategory::Performance,
                        rule.code,
                        rule.message,
                    )
                    .at_line(line.number)
                    .with_suggestion(rule.suggestion),
                );
            }
        }

        if has_large_range(&line.masked) {
            issues.push(
                ValidationIssue::new(
                    Severity::Warning,
                    IssueCategory::Performance,
                    "large-loop",
                    format!("Loop over a range of {} or more items", LARGE_RANGE),
                )
                .at_line(line.number)
                .with_suggestion("Process data in bounded batches"),
            );
        }
    }

    for function in &parsed.functions {
        let complexity = cyclomatic_complexity(parsed, function);
        if complexity > settings.complexity_threshold {
            issues.push(
                ValidationIssue::new(
                    Severity::Warning,
                    IssueCategory::Performance,
                    "high-complexity",
                    format!(
                        "Function '{}' has cyclomatic complexity {} (threshold {})",
                        function.name, complexity, settings.complexity_threshold
                    ),
                )
                .at_line(function.line)
                .with_suggestion("Split the function into smaller helpers"),
            );
        }
    }

    issues
}

pub fn check_correctness(parsed: &ParsedSource, strictness: Strictness) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    match parsed.function("execute") {
        None => issues.push(
            ValidationIssue::new(
                Severity::Error,
                IssueCategory::Correctness,
                "missing-entry-point",
                "Handler must define 'async def execute(self, params)'",
            )
            .with_suggestion("Add an async execute method accepting the input parameters"),
        ),
        Some(execute) => {
            if !execute.is_async {
                issues.push(
                    ValidationIssue::new(
                        Severity::Error,
                        IssueCategory::Correctness,
                        "sync-entry-point",
                        "Handler entry point 'execute' must be async",
                    )
                    .at_line(execute.line)
                    .with_suggestion("Declare it as 'async def execute'"),
                );
            }
            if execute.params.is_empty() {
                issues.push(
                    ValidationIssue::new(
                        Severity::Error,
                        IssueCategory::Correctness,
                        "missing-params-argument",
                        "Handler entry point 'execute' must accept the input parameters",
                    )
                    .at_line(execute.line)
                    .with_suggestion("Declare it as 'async def execute(self, params)'"),
                );
            }
        }
    }

    if strictness.is_elevated() && !parsed.has_exception_handling() {
        issues.push(
            ValidationIssue::new(
                Severity::Warning,
                IssueCategory::Correctness,
                "no-error-handling",
                "Handler has no exception handling",
            )
            .with_suggestion("Wrap external calls in try/except and return a status"),
        );
    }

    issues
}

pub fn check_style(
    source: &str,
    parsed: &ParsedSource,
    strictness: Strictness,
    settings: &ValidationSettings,
) -> Vec<ValidationIssue> {
    if !strictness.is_elevated() {
        return Vec::new();
    }
    let mut issues = Vec::new();

    for (index, line) in source.lines().enumerate() {
        let length = line.chars().count();
        if length > settings.max_line_length {
            issues.push(
                ValidationIssue::new(
                    Severity::Info,
                    IssueCategory::Style,
                    "line-too-long",
                    format!(
                        "Line is {} characters long (limit {})",
                        length, settings.max_line_length
                    ),
                )
                .at_line(index + 1),
            );
        }
    }

    for function in parsed.functions.iter().filter(|f| !f.has_return_annotation) {
        issues.push(
            ValidationIssue::new(
                Severity::Info,
                IssueCategory::Style,
                "missing-return-type",
                format!("Function '{}' has no return type annotation", function.name),
            )
            .at_line(function.line),
        );
    }

    issues
}
