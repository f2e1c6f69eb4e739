//! Resource names and ARNs.

use crate::error::RuntimeError;

const MAX_NAME_LEN: usize = 80;
const FORBIDDEN: &[char] = &[
    '<', '>', '{', '}', '[', ']', '?', '*', '"', '#', '%', '\\', '^', '|', '~', '`', '$', '&',
    ',', ';', ':', '/',
];

/// Validates a state machine or execution name.
pub fn validate_name(name: &str) -> Result<(), RuntimeError> {
    let invalid = |reason: &str| RuntimeError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(invalid("must be at most 80 characters"));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("must not contain whitespace or control characters"));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(invalid(&format!("must not contain '{c}'")));
    }
    Ok(())
}

pub fn state_machine_arn(region: &str, account: &str, name: &str) -> String {
    format!("arn:aws:states:{region}:{account}:stateMachine:{name}")
}

pub fn execution_arn(region: &str, account: &str, machine: &str, name: &str) -> String {
    format!("arn:aws:states:{region}:{account}:execution:{machine}:{name}")
}

/// A parsed states ARN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceArn {
    StateMachine {
        region: String,
        account: String,
        name: String,
    },
    Execution {
        region: String,
        account: String,
        machine: String,
        name: String,
    },
}

impl ResourceArn {
    pub fn parse(arn: &str) -> Result<Self, RuntimeError> {
        let invalid = |reason: &str| RuntimeError::InvalidArn {
            arn: arn.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = arn.split(':').collect();
        if parts.len() < 7 || parts[..3] != ["arn", "aws", "states"] {
            return Err(invalid("expected arn:aws:states:{region}:{account}:..."));
        }
        let (region, account) = (parts[3], parts[4]);
        if region.is_empty() || account.is_empty() {
            return Err(invalid("region and account must not be empty"));
        }

        let resource = match (parts[5], &parts[6..]) {
            ("stateMachine", [name]) => {
                validate_name(name).map_err(|e| invalid(&e.to_string()))?;
                ResourceArn::StateMachine {
                    region: region.to_string(),
                    account: account.to_string(),
                    name: name.to_string(),
                }
            }
            ("execution", [machine, name]) => {
                validate_name(machine).map_err(|e| invalid(&e.to_string()))?;
                validate_name(name).map_err(|e| invalid(&e.to_string()))?;
                ResourceArn::Execution {
                    region: region.to_string(),
                    account: account.to_string(),
                    machine: machine.to_string(),
                    name: name.to_string(),
                }
            }
            (kind, _) => return Err(invalid(&format!("unsupported resource type '{kind}'"))),
        };
        Ok(resource)
    }

    /// Parses an ARN that must name a state machine.
    pub fn state_machine(arn: &str) -> Result<Self, RuntimeError> {
        match Self::parse(arn)? {
            parsed @ ResourceArn::StateMachine { .. } => Ok(parsed),
            ResourceArn::Execution { .. } => Err(RuntimeError::InvalidArn {
                arn: arn.to_string(),
                reason: "expected a state machine ARN".to_string(),
            }),
        }
    }

    /// Parses an ARN that must name an execution.
    pub fn execution(arn: &str) -> Result<Self, RuntimeError> {
        match Self::parse(arn)? {
            parsed @ ResourceArn::Execution { .. } => Ok(parsed),
            ResourceArn::StateMachine { .. } => Err(RuntimeError::InvalidArn {
                arn: arn.to_string(),
                reason: "expected an execution ARN".to_string(),
            }),
        }
    }
}
