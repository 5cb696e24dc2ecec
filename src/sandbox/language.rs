use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Supported language tags. Wire spelling matches the tag returned by
/// [`Language::tag`]; lookup is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "GO")]
    Go,
    #[serde(rename = "JAVA")]
    Java,
    #[serde(rename = "PYTHON")]
    Python,
    #[serde(rename = "JAVASCRIPT")]
    JavaScript,
    #[serde(rename = "RUST")]
    Rust,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "C++")]
    Cpp,
    #[serde(rename = "C#")]
    CSharp,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Go,
        Language::Java,
        Language::Python,
        Language::JavaScript,
        Language::Rust,
        Language::C,
        Language::Cpp,
        Language::CSharp,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Language::Go => "GO",
            Language::Java => "JAVA",
            Language::Python => "PYTHON",
            Language::JavaScript => "JAVASCRIPT",
            Language::Rust => "RUST",
            Language::C => "C",
            Language::Cpp => "C++",
            Language::CSharp => "C#",
        }
    }

    pub fn file_suffix(self) -> &'static str {
        match self {
            Language::Go => ".go",
            Language::Java => ".java",
            Language::Python => ".py",
            Language::JavaScript => ".js",
            Language::Rust => ".rs",
            Language::C => ".c",
            Language::Cpp => ".cpp",
            Language::CSharp => ".cs",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        let upper = tag.trim().to_ascii_uppercase();
        Language::ALL
            .into_iter()
            .find(|lang| lang.tag() == upper)
    }

    /// Maps a source file name to the language the submission pipeline
    /// executes. Only these four suffixes are accepted at submit time;
    /// the remaining registry tags exist for descriptor lookup and
    /// reserve prewarming but fail submission as unsupported.
    pub fn from_file_name(filename: &str) -> Option<Self> {
        if filename.ends_with(".py") {
            Some(Language::Python)
        } else if filename.ends_with(".cpp") {
            Some(Language::Cpp)
        } else if filename.ends_with(".js") {
            Some(Language::JavaScript)
        } else if filename.ends_with(".java") {
            Some(Language::Java)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Per-language execution strategy: which image to run in and how to turn a
/// source file into a shell invocation.
pub trait LanguageExecutor: Send + Sync {
    fn image(&self) -> &str;
    fn exec_command(&self, filename: &str) -> String;
}

struct GoExecutor;

impl LanguageExecutor for GoExecutor {
    fn image(&self) -> &str {
        "golang:1.20"
    }

    fn exec_command(&self, filename: &str) -> String {
        format!("go mod init sandbox && go mod tidy && go run {filename}")
    }
}

struct JavaExecutor;

impl LanguageExecutor for JavaExecutor {
    fn image(&self) -> &str {
        "openjdk:17"
    }

    fn exec_command(&self, filename: &str) -> String {
        // Source-file launch mode; no separate javac step.
        format!("java {filename}")
    }
}

struct PythonExecutor;

impl LanguageExecutor for PythonExecutor {
    fn image(&self) -> &str {
        "python:3.10"
    }

    fn exec_command(&self, filename: &str) -> String {
        format!("python {filename}")
    }
}

struct NodeExecutor;

impl LanguageExecutor for NodeExecutor {
    fn image(&self) -> &str {
        "node:18"
    }

    fn exec_command(&self, filename: &str) -> String {
        format!("node {filename}")
    }
}

struct RustExecutor;

impl LanguageExecutor for RustExecutor {
    fn image(&self) -> &str {
        "rust:1.70"
    }

    fn exec_command(&self, filename: &str) -> String {
        format!("rustc {filename} -o main && ./main")
    }
}

struct CExecutor;

impl LanguageExecutor for CExecutor {
    fn image(&self) -> &str {
        "gcc:12"
    }

    fn exec_command(&self, filename: &str) -> String {
        format!("gcc {filename} -o a.out && ./a.out")
    }
}

struct CppExecutor;

impl LanguageExecutor for CppExecutor {
    fn image(&self) -> &str {
        "gcc:12"
    }

    fn exec_command(&self, filename: &str) -> String {
        format!("g++ {filename} -o a.out && ./a.out")
    }
}

struct CSharpExecutor;

impl LanguageExecutor for CSharpExecutor {
    fn image(&self) -> &str {
        "mcr.microsoft.com/dotnet/sdk:7.0"
    }

    fn exec_command(&self, filename: &str) -> String {
        format!(
            "dotnet new console -o csrun --force >/dev/null && cp {filename} csrun/Program.cs && dotnet run --project csrun"
        )
    }
}

/// Map from language tag to executor, built once at startup.
pub struct LanguageRegistry {
    executors: HashMap<Language, Arc<dyn LanguageExecutor>>,
}

impl LanguageRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registry with every supported language wired to its strategy.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Language::Go, Arc::new(GoExecutor));
        registry.register(Language::Java, Arc::new(JavaExecutor));
        registry.register(Language::Python, Arc::new(PythonExecutor));
        registry.register(Language::JavaScript, Arc::new(NodeExecutor));
        registry.register(Language::Rust, Arc::new(RustExecutor));
        registry.register(Language::C, Arc::new(CExecutor));
        registry.register(Language::Cpp, Arc::new(CppExecutor));
        registry.register(Language::CSharp, Arc::new(CSharpExecutor));
        registry
    }

    pub fn register(&mut self, language: Language, executor: Arc<dyn LanguageExecutor>) {
        self.executors.insert(language, executor);
    }

    pub fn get(&self, language: Language) -> Option<Arc<dyn LanguageExecutor>> {
        self.executors.get(&language).cloned()
    }

    pub fn get_by_tag(&self, tag: &str) -> Option<(Language, Arc<dyn LanguageExecutor>)> {
        let language = Language::from_tag(tag)?;
        self.get(language).map(|executor| (language, executor))
    }

    /// All registered languages, used for reserve prewarming.
    pub fn languages(&self) -> Vec<Language> {
        self.executors.keys().copied().collect()
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
