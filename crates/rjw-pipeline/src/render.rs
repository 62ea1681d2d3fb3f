use rjw_types::{DocumentType, GuestData};

/// A renderer could not produce bytes for a guest.
///
/// Render failures come from bad input or a broken template; they are never
/// retried automatically.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// The guest data cannot be rendered as this document type.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The renderer itself failed.
    #[error("render failed: {0}")]
    Failed(String),

    /// Rendering ran past the configured limit.
    #[error("render timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Turns guest data into document bytes.
///
/// Implementations must be deterministic: the same guest data and document
/// type must yield the same bytes. Rendering runs on the blocking pool, so
/// it may be CPU heavy.
pub trait Renderer: Send + Sync {
    fn render(&self, guest: &GuestData, document_type: DocumentType) -> Result<Vec<u8>, RenderError>;
}

impl<F> Renderer for F
where
    F: Fn(&GuestData, DocumentType) -> Result<Vec<u8>, RenderError> + Send + Sync,
{
    fn render(&self, guest: &GuestData, document_type: DocumentType) -> Result<Vec<u8>, RenderError> {
        self(guest, document_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rjw_types::GuestId;

    #[test]
    fn closures_are_renderers() {
        let renderer = |guest: &GuestData, ty: DocumentType| -> Result<Vec<u8>, RenderError> {
            Ok(format!("{ty} for {}", guest.display_name).into_bytes())
        };
        let guest = GuestData::new(GuestId::new("g1").unwrap(), "The Smiths", 2);
        let bytes = Renderer::render(&renderer, &guest, DocumentType::Invitation).unwrap();
        assert_eq!(bytes, b"invitation for The Smiths");
    }
}
