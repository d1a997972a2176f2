//! Reading the image reference a deploy action rolls out.

use conveyor_core::{Error, Result};
use serde::Deserialize;

/// One entry of an `imagedefinitions.json` file.
#[derive(Debug, Deserialize)]
struct ImageDefinition {
    name: String,
    #[serde(rename = "imageUri")]
    image_uri: String,
}

/// Pick the image for `container` out of an image definitions file.
///
/// A JSON list uses the entry named after the container, or its only entry.
/// Anything that is not JSON is taken as a bare image reference.
pub fn image_reference(contents: &[u8], container: &str) -> Result<String> {
    let text = String::from_utf8_lossy(contents);
    let text = text.trim();

    if text.starts_with('[') {
        let definitions: Vec<ImageDefinition> = serde_json::from_str(text)
            .map_err(|e| Error::DeploymentFailed(format!("malformed image definitions: {}", e)))?;

        if let Some(definition) = definitions.iter().find(|d| d.name == container) {
            return Ok(definition.image_uri.clone());
        }
        return match definitions.as_slice() {
            [only] => Ok(only.image_uri.clone()),
            _ => Err(Error::DeploymentFailed(format!(
                "no image definition for container '{}'",
                container
            ))),
        };
    }

    if text.is_empty() || text.contains(char::is_whitespace) {
        return Err(Error::DeploymentFailed(
            "image file does not hold an image reference".to_string(),
        ));
    }
    Ok(text.to_string())
}
