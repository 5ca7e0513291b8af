//! Input validation utilities shared by the cloud validators
//!
//! Each cloud keeps its own bounds (health check ranges, allowed protocols)
//! and composes these helpers into its ingress validator.

use validator::ValidationError;

/// Maximum length for ingress/listener resource names
pub const MAX_RESOURCE_NAME_LENGTH: usize = 128;

/// Validate a resource name coming from user input
///
/// Names must:
/// - Not be empty
/// - Not exceed MAX_RESOURCE_NAME_LENGTH characters
/// - Contain only alphanumeric characters, dots, hyphens, and underscores
pub fn validate_resource_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("name_empty"));
    }
    if name.len() > MAX_RESOURCE_NAME_LENGTH {
        return Err(ValidationError::new("name_too_long"));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-' || c == '_')
    {
        return Err(ValidationError::new("name_invalid_chars"));
    }
    Ok(())
}

/// Validate a frontend or backend port number
pub fn validate_port(port: i32) -> Result<(), ValidationError> {
    if !(1..=65535).contains(&port) {
        return Err(ValidationError::new("port_out_of_range"));
    }
    Ok(())
}

/// Validate a protocol against the set a cloud supports
pub fn validate_protocol(protocol: &str, allowed: &[&str]) -> Result<(), ValidationError> {
    let upper = protocol.to_uppercase();
    if !allowed.iter().any(|p| *p == upper) {
        return Err(ValidationError::new("protocol_unsupported"));
    }
    Ok(())
}

/// Validate an integer field against inclusive cloud bounds
pub fn validate_range(value: i32, min: i32, max: i32, code: &'static str) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::new(code));
    }
    Ok(())
}

/// Validate a health check HTTP code expression
///
/// The expression is a comma-separated list of items; each item is either a
/// single status code or an increasing `from-to` range. Every code must fall
/// inside the cloud's `[min, max]` bounds.
pub fn validate_http_code_values(codes: &str, min: i32, max: i32) -> Result<(), ValidationError> {
    if codes.is_empty() {
        return Err(ValidationError::new("http_code_empty"));
    }
    for item in codes.split(',') {
        let parts: Vec<&str> = item.split('-').collect();
        match parts.as_slice() {
            [single] => {
                let code: i32 = single
                    .parse()
                    .map_err(|_| ValidationError::new("http_code_not_a_number"))?;
                validate_range(code, min, max, "http_code_out_of_range")?;
            }
            [from, to] => {
                let from: i32 = from
                    .parse()
                    .map_err(|_| ValidationError::new("http_code_not_a_number"))?;
                let to: i32 = to
                    .parse()
                    .map_err(|_| ValidationError::new("http_code_not_a_number"))?;
                if from >= to {
                    return Err(ValidationError::new("http_code_range_not_increasing"));
                }
                validate_range(from, min, max, "http_code_out_of_range")?;
                validate_range(to, min, max, "http_code_out_of_range")?;
            }
            _ => return Err(ValidationError::new("http_code_bad_range")),
        }
    }
    Ok(())
}

/// Whether two half-open `[start, end)` port intervals overlap
pub fn intervals_overlap(a: (i32, i32), b: (i32, i32)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_resource_name() {
        assert!(validate_resource_name("my-ingress.v1").is_ok());
        assert!(validate_resource_name("web_01").is_ok());
        assert!(validate_resource_name("").is_err());
        assert!(validate_resource_name("bad/name").is_err());
        assert!(validate_resource_name(&"a".repeat(MAX_RESOURCE_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_port() {
        assert!(validate_port(1).is_ok());
        assert!(validate_port(65535).is_ok());
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
        assert!(validate_port(-1).is_err());
    }

    #[test]
    fn test_validate_protocol() {
        let allowed = ["TCP", "UDP", "HTTP", "HTTPS"];
        assert!(validate_protocol("tcp", &allowed).is_ok());
        assert!(validate_protocol("HTTPS", &allowed).is_ok());
        assert!(validate_protocol("SCTP", &allowed).is_err());
        assert!(validate_protocol("", &allowed).is_err());
    }

    #[test]
    fn test_validate_http_code_values() {
        // Bounds used by the AWS validator
        assert!(validate_http_code_values("200", 200, 499).is_ok());
        assert!(validate_http_code_values("199", 200, 499).is_err());
        assert!(validate_http_code_values("200,201", 200, 499).is_ok());
        assert!(validate_http_code_values("200,201,a", 200, 499).is_err());
        assert!(validate_http_code_values("200-299", 200, 499).is_ok());
        assert!(validate_http_code_values("299-200", 200, 499).is_err());
        assert!(validate_http_code_values("200-299-399", 200, 499).is_err());
        assert!(validate_http_code_values("", 200, 499).is_err());
    }

    #[test]
    fn test_intervals_overlap() {
        assert!(intervals_overlap((30000, 30010), (30005, 30015)));
        assert!(intervals_overlap((30005, 30015), (30000, 30010)));
        assert!(!intervals_overlap((30000, 30010), (30010, 30020)));
        assert!(!intervals_overlap((30000, 30000), (30000, 30010)));
    }
}
