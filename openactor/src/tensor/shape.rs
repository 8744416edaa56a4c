use anyhow::{anyhow, Result};

/// Element count for a shape; the empty shape is a scalar with one element.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Format a shape the way dumps print it: `[2, 3]`, `[]` for scalars.
pub fn format_shape(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|dim| dim.to_string()).collect();
    format!("[{}]", dims.join(", "))
}

/// Shape of an elementwise result, allowing single-element operands to broadcast.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
    if lhs == rhs {
        return Ok(lhs.to_vec());
    }
    let (lhs_len, rhs_len) = (numel(lhs), numel(rhs));
    if rhs_len == 1 {
        return Ok(lhs.to_vec());
    }
    if lhs_len == 1 {
        return Ok(rhs.to_vec());
    }
    Err(anyhow!(
        "shapes {} and {} are not broadcast compatible",
        format_shape(lhs),
        format_shape(rhs)
    ))
}
