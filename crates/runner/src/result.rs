//! Runner Result (spec §3): the nested result document the runner produces,
//! independent of which sub-driver (shell, module, SSH) produced it.

use serde::{Serialize, Serializer};

/// `OK=0`, `FAILED=1`, `TIMEOUT=2`, `INIT=255` (spec §6 "Error codes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrCode {
    Ok,
    Failed,
    Timeout,
    Init,
}

impl ErrCode {
    pub fn as_i64(self) -> i64 {
        match self {
            ErrCode::Ok => 0,
            ErrCode::Failed => 1,
            ErrCode::Timeout => 2,
            ErrCode::Init => 255,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, ErrCode::Ok)
    }
}

impl Serialize for ErrCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

/// One host's response to a single module invocation, keyed by host id.
/// For local execution a single implicit host (`"localhost"`) is used.
#[derive(Debug, Clone, Serialize)]
pub struct HostResponse {
    pub host: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleResult {
    pub module: String,
    pub errcode: ErrCode,
    pub errmsg: String,
    pub response: Vec<HostResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupResult {
    pub group_id: String,
    pub errcode: ErrCode,
    pub errmsg: String,
    pub modules: Vec<ModuleResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub id: String,
    pub description: String,
    pub errcode: ErrCode,
    pub groups: Vec<GroupResult>,
}

impl GroupResult {
    /// Aggregate from module results per the common driver rule: `OK` iff
    /// every module in the group succeeded; errmsg is the first failure's.
    pub fn from_modules(group_id: String, modules: Vec<ModuleResult>) -> Self {
        let first_failure = modules.iter().find(|m| !m.errcode.is_ok());
        let errcode = if first_failure.is_some() {
            ErrCode::Failed
        } else {
            ErrCode::Ok
        };
        let errmsg = first_failure.map(|m| m.errmsg.clone()).unwrap_or_default();
        Self {
            group_id,
            errcode,
            errmsg,
            modules,
        }
    }
}

impl RunResult {
    /// Aggregate from group results: top-level `OK` iff every group succeeded.
    pub fn from_groups(id: String, description: String, groups: Vec<GroupResult>) -> Self {
        let errcode = if groups.iter().all(|g| g.errcode.is_ok()) {
            ErrCode::Ok
        } else {
            ErrCode::Failed
        };
        Self {
            id,
            description,
            errcode,
            groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(ok: bool) -> ModuleResult {
        ModuleResult {
            module: "shell".into(),
            errcode: if ok { ErrCode::Ok } else { ErrCode::Failed },
            errmsg: if ok { String::new() } else { "boom".into() },
            response: Vec::new(),
        }
    }

    #[test]
    fn group_ok_iff_all_modules_ok() {
        let group = GroupResult::from_modules("g1".into(), vec![module(true), module(true)]);
        assert!(group.errcode.is_ok());
        assert!(group.errmsg.is_empty());
    }

    #[test]
    fn group_failed_reports_first_failure_message() {
        let group =
            GroupResult::from_modules("g1".into(), vec![module(true), module(false), module(false)]);
        assert_eq!(group.errcode, ErrCode::Failed);
        assert_eq!(group.errmsg, "boom");
    }

    #[test]
    fn run_ok_iff_all_groups_ok() {
        let ok_group = GroupResult::from_modules("g1".into(), vec![module(true)]);
        let failed_group = GroupResult::from_modules("g2".into(), vec![module(false)]);
        let run = RunResult::from_groups("s1".into(), "d".into(), vec![ok_group, failed_group]);
        assert_eq!(run.errcode, ErrCode::Failed);

        let run_ok = RunResult::from_groups(
            "s1".into(),
            "d".into(),
            vec![GroupResult::from_modules("g1".into(), vec![module(true)])],
        );
        assert!(run_ok.errcode.is_ok());
    }

    #[test]
    fn errcode_serializes_to_its_integer_code() {
        assert_eq!(serde_json::to_string(&ErrCode::Ok).unwrap(), "0");
        assert_eq!(serde_json::to_string(&ErrCode::Failed).unwrap(), "1");
        assert_eq!(serde_json::to_string(&ErrCode::Timeout).unwrap(), "2");
        assert_eq!(serde_json::to_string(&ErrCode::Init).unwrap(), "255");
    }
}
