//! Compiler registry: toolchain probing and command templates.
//!
//! Languages are table entries, not branch arms: each entry carries the
//! executable to probe, default flags, claimed extensions, and how to render
//! compile/run/check commands inside a sandbox.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

use crate::proto::{ExecMode, Language};

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("toolchain for {0} is not available on this host")]
    UnavailableToolchain(Language),
    #[error("{mode} is not valid for {language}")]
    InvalidMode {
        language: Language,
        mode: ExecMode,
    },
}

/// How the language's source becomes something executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// Compile to a native artifact, then run the artifact.
    Compiled,
    /// `go build` takes the output flag before the source.
    CompiledGo,
    /// Compile to class files, run through the JVM using the source stem.
    Jvm,
    /// No compile step; the interpreter runs the source directly.
    Interpreted,
}

struct ToolchainSpec {
    language: Language,
    executable: &'static str,
    probe_args: &'static [&'static str],
    default_flags: &'static str,
    extensions: &'static str,
    detection_priority: u8,
    flavor: Flavor,
    /// Syntax-check invocation, rendered with the quoted source appended.
    check_template: Option<&'static str>,
}

const TOOLCHAINS: &[ToolchainSpec] = &[
    ToolchainSpec {
        language: Language::C,
        executable: "gcc",
        probe_args: &["--version"],
        default_flags: "-Wall -Wextra -std=c99",
        extensions: ".c",
        detection_priority: 10,
        flavor: Flavor::Compiled,
        check_template: Some("-fsyntax-only"),
    },
    ToolchainSpec {
        language: Language::Cpp,
        executable: "g++",
        probe_args: &["--version"],
        default_flags: "-Wall -Wextra -std=c++17",
        extensions: ".cpp,.cc,.cxx",
        detection_priority: 10,
        flavor: Flavor::Compiled,
        check_template: Some("-fsyntax-only"),
    },
    ToolchainSpec {
        language: Language::Java,
        executable: "javac",
        probe_args: &["-version"],
        default_flags: "-cp .",
        extensions: ".java",
        detection_priority: 8,
        flavor: Flavor::Jvm,
        check_template: None,
    },
    ToolchainSpec {
        language: Language::Python,
        executable: "python3",
        probe_args: &["--version"],
        default_flags: "-B",
        extensions: ".py",
        detection_priority: 7,
        flavor: Flavor::Interpreted,
        check_template: Some("-m py_compile"),
    },
    ToolchainSpec {
        language: Language::JavaScript,
        executable: "node",
        probe_args: &["--version"],
        default_flags: "",
        extensions: ".js",
        detection_priority: 6,
        flavor: Flavor::Interpreted,
        check_template: Some("--check"),
    },
    ToolchainSpec {
        language: Language::Go,
        executable: "go",
        probe_args: &["version"],
        default_flags: "",
        extensions: ".go",
        detection_priority: 5,
        flavor: Flavor::CompiledGo,
        check_template: None,
    },
    ToolchainSpec {
        language: Language::Rust,
        executable: "rustc",
        probe_args: &["--version"],
        default_flags: "--edition 2021",
        extensions: ".rs",
        detection_priority: 4,
        flavor: Flavor::Compiled,
        check_template: Some("--emit metadata"),
    },
];

/// A probed, available toolchain.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub language: Language,
    pub name: &'static str,
    pub path: PathBuf,
    pub version: String,
    pub default_flags: &'static str,
    pub extensions: &'static str,
    pub detection_priority: u8,
    flavor: Flavor,
    check_template: Option<&'static str>,
}

/// What the worker has to run for one job: an optional compile step and an
/// optional run step, both `sh -c` command strings executed with the sandbox
/// as working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub compile: Option<String>,
    pub run: Option<String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    toolchains: HashMap<Language, Toolchain>,
}

impl Registry {
    /// Probe the host for every toolchain in the table.
    pub fn probe() -> Self {
        let mut toolchains = HashMap::new();
        for spec in TOOLCHAINS {
            let Some(path) = find_in_path(spec.executable) else {
                debug!(language = %spec.language, executable = spec.executable, "toolchain not found");
                continue;
            };
            let Some(version) = probe_version(&path, spec.probe_args) else {
                debug!(language = %spec.language, path = %path.display(), "toolchain probe failed");
                continue;
            };
            info!(language = %spec.language, path = %path.display(), version = %version, "detected toolchain");
            toolchains.insert(
                spec.language,
                Toolchain {
                    language: spec.language,
                    name: spec.executable,
                    path,
                    version,
                    default_flags: spec.default_flags,
                    extensions: spec.extensions,
                    detection_priority: spec.detection_priority,
                    flavor: spec.flavor,
                    check_template: spec.check_template,
                },
            );
        }
        Self { toolchains }
    }

    /// Registry with a fixed toolchain set; unit tests use this to render
    /// commands without touching the host.
    #[cfg(test)]
    fn with_paths(paths: &[(Language, &str)]) -> Self {
        let mut toolchains = HashMap::new();
        for (language, path) in paths {
            let spec = TOOLCHAINS
                .iter()
                .find(|spec| spec.language == *language)
                .expect("language in table");
            toolchains.insert(
                *language,
                Toolchain {
                    language: spec.language,
                    name: spec.executable,
                    path: PathBuf::from(path),
                    version: "test".into(),
                    default_flags: spec.default_flags,
                    extensions: spec.extensions,
                    detection_priority: spec.detection_priority,
                    flavor: spec.flavor,
                    check_template: spec.check_template,
                },
            );
        }
        Self { toolchains }
    }

    pub fn available(&self) -> impl Iterator<Item = &Toolchain> {
        self.toolchains.values()
    }

    pub fn is_available(&self, language: Language) -> bool {
        self.toolchains.contains_key(&language)
    }

    /// Whether a mode makes sense for a language at all, independent of what
    /// the probe found. `Interpret` is the only mode with a real constraint:
    /// every language renders a compile or check step, and a syntax check
    /// falls back to a plain compile.
    pub fn mode_supported(&self, language: Language, mode: ExecMode) -> bool {
        let Some(spec) = TOOLCHAINS.iter().find(|spec| spec.language == language) else {
            return false;
        };
        match mode {
            ExecMode::Interpret => spec.flavor == Flavor::Interpreted,
            ExecMode::CompileOnly | ExecMode::CompileAndRun | ExecMode::SyntaxCheck => true,
        }
    }

    pub fn get(&self, language: Language) -> Result<&Toolchain, ToolchainError> {
        self.toolchains
            .get(&language)
            .ok_or(ToolchainError::UnavailableToolchain(language))
    }

    /// Build the compile/run command pair for a job.
    pub fn plan(
        &self,
        language: Language,
        mode: ExecMode,
        filename: &str,
        compiler_args: &str,
        execution_args: &str,
    ) -> Result<ExecutionPlan, ToolchainError> {
        let toolchain = self.get(language)?;
        let exe = toolchain.path.display().to_string();
        let stem = file_stem(filename);
        let artifact = format!("{stem}_exe");
        let source = sh_quote(filename);

        let compile = match toolchain.flavor {
            Flavor::Compiled => Some(join_cmd(&[
                &exe,
                toolchain.default_flags,
                compiler_args,
                "-o",
                &sh_quote(&artifact),
                &source,
            ])),
            Flavor::CompiledGo => Some(join_cmd(&[
                &exe,
                "build",
                compiler_args,
                "-o",
                &sh_quote(&artifact),
                &source,
            ])),
            Flavor::Jvm => Some(join_cmd(&[
                &exe,
                toolchain.default_flags,
                compiler_args,
                &source,
            ])),
            Flavor::Interpreted => None,
        };

        let run = match toolchain.flavor {
            Flavor::Compiled | Flavor::CompiledGo => Some(join_cmd(&[
                &format!("./{}", sh_quote(&artifact)),
                execution_args,
            ])),
            Flavor::Jvm => Some(join_cmd(&["java", &sh_quote(&stem), execution_args])),
            Flavor::Interpreted => Some(join_cmd(&[
                &exe,
                toolchain.default_flags,
                &source,
                execution_args,
            ])),
        };

        let check = |toolchain: &Toolchain| {
            toolchain
                .check_template
                .map(|flags| join_cmd(&[&exe, flags, compiler_args, &source]))
                .or_else(|| compile.clone())
        };

        match mode {
            ExecMode::CompileOnly => match compile.clone().or_else(|| check(toolchain)) {
                Some(step) => Ok(ExecutionPlan {
                    compile: Some(step),
                    run: None,
                }),
                None => Err(ToolchainError::InvalidMode { language, mode }),
            },
            ExecMode::CompileAndRun => Ok(ExecutionPlan {
                compile: compile.clone(),
                run,
            }),
            ExecMode::Interpret => {
                if toolchain.flavor != Flavor::Interpreted {
                    return Err(ToolchainError::InvalidMode { language, mode });
                }
                Ok(ExecutionPlan {
                    compile: None,
                    run,
                })
            }
            ExecMode::SyntaxCheck => match check(toolchain) {
                Some(step) => Ok(ExecutionPlan {
                    compile: Some(step),
                    run: None,
                }),
                None => Err(ToolchainError::InvalidMode { language, mode }),
            },
        }
    }
}

fn file_stem(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => filename.to_string(),
    }
}

/// Quote one word for `sh -c`. Filenames have already passed validation, but
/// quoting keeps spaces and shell metacharacters inert.
fn sh_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'/'))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', "'\\''"))
}

fn join_cmd(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(part);
    }
    out
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// First non-empty output line of the probe command. `javac -version` and
/// friends write to stderr, so both streams are consulted.
fn probe_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Registry {
        Registry::with_paths(&[
            (Language::C, "/usr/bin/gcc"),
            (Language::Cpp, "/usr/bin/g++"),
            (Language::Java, "/usr/bin/javac"),
            (Language::Python, "/usr/bin/python3"),
            (Language::JavaScript, "/usr/bin/node"),
            (Language::Go, "/usr/bin/go"),
            (Language::Rust, "/usr/bin/rustc"),
        ])
    }

    #[test]
    fn c_compile_and_run_commands() {
        let plan = test_registry()
            .plan(Language::C, ExecMode::CompileAndRun, "a.c", "-O2", "arg1")
            .unwrap();
        assert_eq!(
            plan.compile.as_deref(),
            Some("/usr/bin/gcc -Wall -Wextra -std=c99 -O2 -o a_exe a.c")
        );
        assert_eq!(plan.run.as_deref(), Some("./a_exe arg1"));
    }

    #[test]
    fn go_build_places_output_flag_before_source() {
        let plan = test_registry()
            .plan(Language::Go, ExecMode::CompileOnly, "main.go", "", "")
            .unwrap();
        assert_eq!(
            plan.compile.as_deref(),
            Some("/usr/bin/go build -o main_exe main.go")
        );
        assert!(plan.run.is_none());
    }

    #[test]
    fn java_runs_the_source_stem_as_main_class() {
        let plan = test_registry()
            .plan(Language::Java, ExecMode::CompileAndRun, "Main.java", "", "7")
            .unwrap();
        assert_eq!(
            plan.compile.as_deref(),
            Some("/usr/bin/javac -cp . Main.java")
        );
        assert_eq!(plan.run.as_deref(), Some("java Main 7"));
    }

    #[test]
    fn interpreters_skip_the_compile_step() {
        let plan = test_registry()
            .plan(Language::Python, ExecMode::CompileAndRun, "a.py", "", "x y")
            .unwrap();
        assert!(plan.compile.is_none());
        assert_eq!(plan.run.as_deref(), Some("/usr/bin/python3 -B a.py x y"));
    }

    #[test]
    fn syntax_check_uses_check_flags() {
        let registry = test_registry();
        let c = registry
            .plan(Language::C, ExecMode::SyntaxCheck, "a.c", "", "")
            .unwrap();
        assert_eq!(c.compile.as_deref(), Some("/usr/bin/gcc -fsyntax-only a.c"));
        assert!(c.run.is_none());

        let py = registry
            .plan(Language::Python, ExecMode::SyntaxCheck, "a.py", "", "")
            .unwrap();
        assert_eq!(
            py.compile.as_deref(),
            Some("/usr/bin/python3 -m py_compile a.py")
        );

        // Languages without a dedicated check fall back to a plain compile.
        let java = registry
            .plan(Language::Java, ExecMode::SyntaxCheck, "Main.java", "", "")
            .unwrap();
        assert_eq!(
            java.compile.as_deref(),
            Some("/usr/bin/javac -cp . Main.java")
        );
    }

    #[test]
    fn interpret_mode_rejects_compiled_languages() {
        let err = test_registry()
            .plan(Language::C, ExecMode::Interpret, "a.c", "", "")
            .unwrap_err();
        assert!(matches!(err, ToolchainError::InvalidMode { .. }));
    }

    #[test]
    fn mode_support_mirrors_the_plan() {
        let registry = test_registry();
        for lang in Language::ALL {
            for mode in [
                ExecMode::CompileOnly,
                ExecMode::CompileAndRun,
                ExecMode::Interpret,
                ExecMode::SyntaxCheck,
            ] {
                let supported = registry.mode_supported(lang, mode);
                let planned = registry.plan(lang, mode, "a.x", "", "").is_ok();
                assert_eq!(supported, planned, "{lang} {}", mode.as_str());
            }
        }
        assert!(registry.mode_supported(Language::Python, ExecMode::Interpret));
        assert!(!registry.mode_supported(Language::C, ExecMode::Interpret));
        assert!(!registry.mode_supported(Language::Go, ExecMode::Interpret));
    }

    #[test]
    fn unavailable_toolchain_is_an_error() {
        let registry = Registry::with_paths(&[(Language::C, "/usr/bin/gcc")]);
        assert!(registry.is_available(Language::C));
        assert!(!registry.is_available(Language::Rust));
        assert!(matches!(
            registry.plan(Language::Rust, ExecMode::CompileOnly, "a.rs", "", ""),
            Err(ToolchainError::UnavailableToolchain(Language::Rust))
        ));
    }

    #[test]
    fn quoting_neutralizes_shell_metacharacters() {
        assert_eq!(sh_quote("a.c"), "a.c");
        assert_eq!(sh_quote("my file.c"), "'my file.c'");
        assert_eq!(sh_quote("a'b"), "'a'\\''b'");
    }
}
