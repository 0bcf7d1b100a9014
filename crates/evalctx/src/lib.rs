//! Predicate evaluator (component D).
//!
//! This crate is intentionally the only place in the workspace that knows
//! about the embedded scripting engine. The compiler only ever sees
//! [`Evaluator`], [`ScriptContext`], and [`EvalValue`] — never a `rhai`
//! type — so the evaluator can be swapped out without touching the
//! compiler, per spec §9 "Companion scripts and evaluator coupling".
//!
//! The original `nanostate` embeds Starlark (see
//! `nanostate/compiler/starutils.go`, `StarlarkProcess`); the spec treats
//! the evaluator as an opaque dependency exposing `load`/`call` plus a
//! fixed set of built-in bindings, so we use `rhai` — a real, widely used
//! embeddable scripting engine for Rust — behind the same narrow contract.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not read script file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("script parse error in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<rhai::ParseError>,
    },
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("error calling function '{name}': {message}")]
    Call { name: String, message: String },
}

/// Truthy/typed value a script function can return or accept.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<EvalValue>),
    Dict(BTreeMap<String, EvalValue>),
    Unit,
}

impl EvalValue {
    /// Truthiness per spec §4.D: bools are themselves, numbers are truthy if
    /// non-zero, strings/lists/dicts are truthy if non-empty, unit is falsy.
    pub fn truthy(&self) -> bool {
        match self {
            EvalValue::Bool(b) => *b,
            EvalValue::Int(i) => *i != 0,
            EvalValue::Str(s) => !s.is_empty(),
            EvalValue::List(l) => !l.is_empty(),
            EvalValue::Dict(d) => !d.is_empty(),
            EvalValue::Unit => false,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, EvalValue>> {
        match self {
            EvalValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[EvalValue]> {
        match self {
            EvalValue::List(l) => Some(l),
            _ => None,
        }
    }
}

impl From<EvalValue> for rhai::Dynamic {
    fn from(v: EvalValue) -> Self {
        match v {
            EvalValue::Bool(b) => b.into(),
            EvalValue::Int(i) => i.into(),
            EvalValue::Str(s) => s.into(),
            EvalValue::List(l) => {
                rhai::Dynamic::from_array(l.into_iter().map(rhai::Dynamic::from).collect())
            }
            EvalValue::Dict(d) => {
                let mut map = rhai::Map::new();
                for (k, v) in d {
                    map.insert(k.into(), v.into());
                }
                rhai::Dynamic::from_map(map)
            }
            EvalValue::Unit => rhai::Dynamic::UNIT,
        }
    }
}

fn dynamic_to_eval(d: rhai::Dynamic) -> EvalValue {
    if d.is_unit() {
        return EvalValue::Unit;
    }
    if let Some(b) = d.clone().try_cast::<bool>() {
        return EvalValue::Bool(b);
    }
    if let Some(i) = d.clone().try_cast::<i64>() {
        return EvalValue::Int(i);
    }
    if let Some(s) = d.clone().try_cast::<rhai::ImmutableString>() {
        return EvalValue::Str(s.to_string());
    }
    if let Some(arr) = d.clone().try_cast::<rhai::Array>() {
        return EvalValue::List(arr.into_iter().map(dynamic_to_eval).collect());
    }
    if let Some(map) = d.try_cast::<rhai::Map>() {
        let mut out = BTreeMap::new();
        for (k, v) in map {
            out.insert(k.to_string(), dynamic_to_eval(v));
        }
        return EvalValue::Dict(out);
    }
    EvalValue::Unit
}

/// Facts about the target environment, injected read-only into every
/// `ScriptContext`. Constructed once per compile session (spec §9: "Global
/// mutable traits map" — we build an immutable snapshot instead).
#[derive(Debug, Clone)]
pub struct Traits {
    pub os_sysname: String,
    pub arch: String,
    pub kernel: String,
    pub kernelrelease: String,
    pub kernelversion: String,
}

impl Traits {
    /// Detect traits for the machine this process is running on.
    pub fn detect() -> Self {
        match uname::uname() {
            Ok(info) => Traits {
                os_sysname: info.sysname.clone(),
                arch: info.machine,
                kernel: info.sysname,
                kernelrelease: info.release,
                kernelversion: info.version,
            },
            Err(_) => Traits {
                os_sysname: std::env::consts::OS.to_owned(),
                arch: std::env::consts::ARCH.to_owned(),
                kernel: std::env::consts::OS.to_owned(),
                kernelrelease: String::new(),
                kernelversion: String::new(),
            },
        }
    }

    fn to_rhai_map(&self) -> rhai::Map {
        let mut os = rhai::Map::new();
        os.insert("sysname".into(), self.os_sysname.clone().into());
        let mut top = rhai::Map::new();
        top.insert("os".into(), rhai::Dynamic::from_map(os));
        top.insert("arch".into(), self.arch.clone().into());
        top.insert("kernel".into(), self.kernel.clone().into());
        top.insert("kernelrelease".into(), self.kernelrelease.clone().into());
        top.insert("kernelversion".into(), self.kernelversion.clone().into());
        top
    }
}

/// A compiled companion script, ready to have its functions called. One per
/// state id, created lazily by [`Evaluator::load`].
pub struct ScriptContext {
    ast: rhai::AST,
    scope: rhai::Scope<'static>,
}

/// The opaque predicate evaluator (spec §4.D). Holds the immutable traits
/// snapshot for the current compile session and the `rhai::Engine` used to
/// parse and run companion scripts.
pub struct Evaluator {
    engine: rhai::Engine,
    traits: Traits,
}

impl Evaluator {
    pub fn new(traits: Traits) -> Self {
        let mut engine = rhai::Engine::new();
        engine.register_fn("os_get_environ", |name: &str| -> rhai::Dynamic {
            std::env::var(name)
                .map(rhai::Dynamic::from)
                .unwrap_or(rhai::Dynamic::UNIT)
        });
        engine.register_fn("os_environ", |names: rhai::Array| -> rhai::Map {
            let mut out = rhai::Map::new();
            for name in names {
                if let Some(name) = name.try_cast::<rhai::ImmutableString>() {
                    if let Ok(value) = std::env::var(name.as_str()) {
                        out.insert(name, value.into());
                    }
                }
            }
            out
        });
        engine.register_fn("os_environ_all", || -> rhai::Map {
            let mut out = rhai::Map::new();
            for (k, v) in std::env::vars() {
                out.insert(k.into(), v.into());
            }
            out
        });
        Self { engine, traits }
    }

    /// Parse `path` as a companion script in a fresh evaluation context.
    /// Only top-level function definitions are kept; re-execution of the
    /// script body is never required by the compiler.
    pub fn load(&self, path: &Path) -> Result<ScriptContext, Error> {
        let source = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        let ast = self
            .engine
            .compile(&source)
            .map_err(|e| Error::Parse {
                path: path.display().to_string(),
                source: Box::new(e),
            })?;
        let mut scope = rhai::Scope::new();
        scope.push_constant("traits", self.traits.to_rhai_map());
        Ok(ScriptContext { ast, scope })
    }

    /// Call `function_name` in `ctx` with the given positional and keyword
    /// arguments. Keyword arguments, when present, are passed as a trailing
    /// dict argument (the compiler only ever calls zero-argument predicates
    /// and generators, so this path exists for contract completeness).
    pub fn call(
        &self,
        ctx: &mut ScriptContext,
        function_name: &str,
        positional: &[EvalValue],
        keyword: &BTreeMap<String, EvalValue>,
    ) -> Result<EvalValue, Error> {
        if !ctx
            .ast
            .iter_functions()
            .any(|f| f.name == function_name && f.params.len() == positional.len() + usize::from(!keyword.is_empty()))
        {
            return Err(Error::UnknownFunction(function_name.to_owned()));
        }

        let mut args: Vec<rhai::Dynamic> = positional.iter().cloned().map(Into::into).collect();
        if !keyword.is_empty() {
            args.push(EvalValue::Dict(keyword.clone()).into());
        }

        let result: rhai::Dynamic = self
            .engine
            .call_fn(&mut ctx.scope, &ctx.ast, function_name, args)
            .map_err(|e| Error::Call {
                name: function_name.to_owned(),
                message: e.to_string(),
            })?;
        Ok(dynamic_to_eval(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".fn").tempfile().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn calls_zero_arg_predicate() {
        let eval = Evaluator::new(Traits::detect());
        let file = write_script("fn on_linux() { traits.kernel == \"Linux\" }");
        let mut ctx = eval.load(file.path()).unwrap();
        let result = eval
            .call(&mut ctx, "on_linux", &[], &BTreeMap::new())
            .unwrap();
        assert!(matches!(result, EvalValue::Bool(_)));
    }

    #[test]
    fn generator_returns_list_of_dicts() {
        let eval = Evaluator::new(Traits::detect());
        let file = write_script(
            r#"
fn names() {
    [ #{ name: "john" }, #{ name: "fred" }, #{ name: "ralf" } ]
}
"#,
        );
        let mut ctx = eval.load(file.path()).unwrap();
        let result = eval.call(&mut ctx, "names", &[], &BTreeMap::new()).unwrap();
        let list = result.as_list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(
            list[0].as_dict().unwrap().get("name"),
            Some(&EvalValue::Str("john".to_owned()))
        );
    }

    #[test]
    fn unknown_function_is_an_error() {
        let eval = Evaluator::new(Traits::detect());
        let file = write_script("fn foo() { true }");
        let mut ctx = eval.load(file.path()).unwrap();
        let err = eval
            .call(&mut ctx, "bar", &[], &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownFunction(_)));
    }
}
