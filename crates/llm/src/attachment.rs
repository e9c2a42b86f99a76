use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use snafu::{Snafu, ensure};

/// A file or voice clip as handed over by the capture side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            data,
        }
    }

    pub fn info(&self) -> AttachmentInfo {
        AttachmentInfo {
            name: self.name.clone(),
            media_type: self.media_type.clone(),
        }
    }
}

/// Lightweight descriptor kept on transcript turns instead of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttachmentInfo {
    pub name: String,
    pub media_type: String,
}

/// Model-facing inline representation: base64 payload plus declared media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinePart {
    pub media_type: String,
    pub data_base64: String,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AttachmentError {
    #[snafu(display("attachment '{name}' has no data"))]
    EmptyPayload { stage: &'static str, name: String },
    #[snafu(display("attachment '{name}' has no media type"))]
    MissingMediaType { stage: &'static str, name: String },
    #[snafu(display("attachment '{name}' has unsupported media type '{media_type}'"))]
    UnsupportedMediaType {
        stage: &'static str,
        name: String,
        media_type: String,
    },
}

impl AttachmentError {
    pub fn attachment_name(&self) -> &str {
        match self {
            Self::EmptyPayload { name, .. }
            | Self::MissingMediaType { name, .. }
            | Self::UnsupportedMediaType { name, .. } => name,
        }
    }
}

/// Result of converting a batch. `parts` and `accepted` are index-aligned and keep input order.
#[derive(Debug, Default)]
pub struct ConvertedAttachments {
    pub parts: Vec<InlinePart>,
    pub accepted: Vec<AttachmentInfo>,
    pub rejected: Vec<AttachmentError>,
}

/// Lowercases and strips parameters, so `Audio/WebM; codecs=opus` becomes `audio/webm`.
pub fn normalize_media_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn to_inline_part(
    attachment: &Attachment,
    accepts: impl Fn(&str) -> bool,
) -> Result<InlinePart, AttachmentError> {
    ensure!(
        !attachment.data.is_empty(),
        EmptyPayloadSnafu {
            stage: "inline-part-payload",
            name: attachment.name.clone(),
        }
    );

    let media_type = normalize_media_type(&attachment.media_type);
    ensure!(
        !media_type.is_empty(),
        MissingMediaTypeSnafu {
            stage: "inline-part-media-type",
            name: attachment.name.clone(),
        }
    );
    ensure!(
        accepts(&media_type),
        UnsupportedMediaTypeSnafu {
            stage: "inline-part-media-type",
            name: attachment.name.clone(),
            media_type,
        }
    );

    Ok(InlinePart {
        media_type,
        data_base64: STANDARD.encode(&attachment.data),
    })
}

/// Converts every attachment independently; one failure never blocks the rest.
pub fn convert_attachments(
    attachments: &[Attachment],
    accepts: impl Fn(&str) -> bool,
) -> ConvertedAttachments {
    let mut converted = ConvertedAttachments::default();

    for attachment in attachments {
        match to_inline_part(attachment, &accepts) {
            Ok(part) => {
                converted.parts.push(part);
                converted.accepted.push(attachment.info());
            }
            Err(error) => {
                tracing::warn!(
                    attachment = %attachment.name,
                    media_type = %attachment.media_type,
                    error = %error,
                    "skipping attachment that could not be converted"
                );
                converted.rejected.push(error);
            }
        }
    }

    converted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_images(media_type: &str) -> bool {
        media_type.starts_with("image/")
    }

    #[test]
    fn media_type_parameters_are_stripped() {
        assert_eq!(normalize_media_type("Audio/WebM; codecs=opus"), "audio/webm");
        assert_eq!(normalize_media_type("  "), "");
    }

    #[test]
    fn payload_is_base64_encoded_with_declared_type() {
        let attachment = Attachment::new("dot.png", "image/png", vec![0x89, b'P', b'N', b'G']);
        let part = to_inline_part(&attachment, accept_images).expect("png converts");
        assert_eq!(part.media_type, "image/png");
        assert_eq!(part.data_base64, "iVBORw==");
    }

    #[test]
    fn one_bad_attachment_does_not_block_the_others() {
        let attachments = vec![
            Attachment::new("a.png", "image/png", vec![1, 2, 3]),
            Attachment::new("notes.bin", "application/x-unknown", vec![4]),
            Attachment::new("empty.png", "image/png", Vec::new()),
            Attachment::new("b.jpg", "image/jpeg", vec![5]),
        ];

        let converted = convert_attachments(&attachments, accept_images);

        let accepted_names = converted
            .accepted
            .iter()
            .map(|info| info.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(accepted_names, ["a.png", "b.jpg"]);
        assert_eq!(converted.parts.len(), 2);
        assert_eq!(converted.parts[1].media_type, "image/jpeg");

        let rejected_names = converted
            .rejected
            .iter()
            .map(AttachmentError::attachment_name)
            .collect::<Vec<_>>();
        assert_eq!(rejected_names, ["notes.bin", "empty.png"]);
        assert!(matches!(
            converted.rejected[0],
            AttachmentError::UnsupportedMediaType { .. }
        ));
        assert!(matches!(
            converted.rejected[1],
            AttachmentError::EmptyPayload { .. }
        ));
    }

    #[test]
    fn missing_media_type_is_rejected() {
        let attachment = Attachment::new("mystery", "", vec![1]);
        let error = to_inline_part(&attachment, |_| true).unwrap_err();
        assert!(matches!(error, AttachmentError::MissingMediaType { .. }));
    }
}
