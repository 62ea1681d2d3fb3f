use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, Stream};
use rjw_pipeline::{RenderError, Renderer};
use rjw_types::{Attendance, DocumentType, GuestData};
use serde::{Deserialize, Serialize};

/// A5 portrait, in points.
const PAGE_WIDTH: f32 = 420.0;
const PAGE_HEIGHT: f32 = 595.0;
const MARGIN: f32 = 48.0;
const TITLE_SIZE: f32 = 20.0;
const BODY_SIZE: f32 = 11.0;
const LEADING: f32 = 18.0;

/// One line of the day's schedule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub time: String,
    pub label: String,
    /// Only printed for groups with wedding party members.
    #[serde(default)]
    pub wedding_party_only: bool,
}

impl ScheduleItem {
    pub fn new(time: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            time: time.into(),
            label: label.into(),
            wedding_party_only: false,
        }
    }

    fn party_only(mut self) -> Self {
        self.wedding_party_only = true;
        self
    }
}

/// Renders invitations and itineraries as single-page PDFs.
///
/// Output depends only on the guest data and the renderer's own settings:
/// no timestamps or document ids are written, so the same input always
/// hashes the same.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfRenderer {
    /// Headline on every document.
    pub title: String,
    pub schedule: Vec<ScheduleItem>,
}

impl Default for PdfRenderer {
    fn default() -> Self {
        Self {
            title: "Our Wedding".into(),
            schedule: vec![
                ScheduleItem::new("11:30", "Wedding party photographs").party_only(),
                ScheduleItem::new("13:00", "Guests arrive"),
                ScheduleItem::new("13:30", "Ceremony"),
                ScheduleItem::new("14:30", "Drinks reception"),
                ScheduleItem::new("16:30", "Wedding breakfast"),
                ScheduleItem::new("19:30", "Evening reception"),
                ScheduleItem::new("00:00", "Carriages"),
            ],
        }
    }
}

impl PdfRenderer {
    pub fn new(title: impl Into<String>, schedule: Vec<ScheduleItem>) -> Self {
        Self {
            title: title.into(),
            schedule,
        }
    }

    fn invitation_lines(&self, guest: &GuestData) -> Vec<String> {
        let mut lines = vec![
            format!("Dear {},", guest.display_name),
            String::new(),
            "You are warmly invited to celebrate with us.".to_string(),
            match guest.count {
                1 => "This invitation is for 1 guest.".to_string(),
                n => format!("This invitation is for {n} guests."),
            },
        ];
        if guest.wedding_party_count > 0 {
            lines.push(format!(
                "{} of you will be part of the wedding party.",
                guest.wedding_party_count
            ));
        }
        lines.push(String::new());
        lines.push(match guest.attendance_status() {
            Attendance::NoResponse => "RSVP: we are awaiting your reply.".to_string(),
            Attendance::Attending => "RSVP: attending. We can't wait to see you!".to_string(),
            Attendance::Declined => "RSVP: declined. You will be missed.".to_string(),
        });
        if let Some(dietary) = non_empty(&guest.dietary_requirements) {
            lines.push(format!("Dietary requirements: {dietary}"));
        }
        if let Some(song) = non_empty(&guest.song_choice) {
            lines.push(format!("Song request: {song}"));
        }
        lines.push(String::new());
        lines.push(format!("Your access code: {}", guest.id));
        lines
    }

    fn itinerary_lines(&self, guest: &GuestData) -> Vec<String> {
        let mut lines = vec![format!("Prepared for {}", guest.display_name), String::new()];
        let in_party = guest.wedding_party_count > 0;
        lines.extend(
            self.schedule
                .iter()
                .filter(|item| in_party || !item.wedding_party_only)
                .map(|item| format!("{}  {}", item.time, item.label)),
        );
        lines.push(String::new());
        if guest.parking_required {
            lines.push("A parking space has been reserved for you.".to_string());
        }
        if let Some(address) = non_empty(&guest.address) {
            let postcode = non_empty(&guest.postcode).unwrap_or_default();
            lines.push(format!("Sent to: {address} {postcode}").trim_end().to_string());
        }
        lines
    }

    fn build(&self, heading: &str, lines: &[String]) -> Result<Vec<u8>, RenderError> {
        let mut doc = Document::with_version("1.7");
        let pages_id = doc.new_object_id();

        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut ops = Vec::with_capacity(lines.len() * 4 + 8);
        let mut y = PAGE_HEIGHT - MARGIN - TITLE_SIZE;
        push_text(&mut ops, TITLE_SIZE, MARGIN, y, &self.title);
        y -= LEADING * 1.5;
        push_text(&mut ops, BODY_SIZE + 3.0, MARGIN, y, heading);
        y -= LEADING * 2.0;
        for line in lines {
            if y < MARGIN {
                return Err(RenderError::InvalidInput(format!(
                    "{heading} does not fit on one page"
                )));
            }
            if !line.is_empty() {
                push_text(&mut ops, BODY_SIZE, MARGIN, y, line);
            }
            y -= LEADING;
        }

        let content = Content { operations: ops }
            .encode()
            .map_err(|e| RenderError::Failed(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out)
            .map_err(|e| RenderError::Failed(e.to_string()))?;
        Ok(out)
    }
}

impl Renderer for PdfRenderer {
    fn render(&self, guest: &GuestData, document_type: DocumentType) -> Result<Vec<u8>, RenderError> {
        if guest.display_name.trim().is_empty() {
            return Err(RenderError::InvalidInput(format!("guest {} has no display name", guest.id)));
        }
        let (heading, lines) = match document_type {
            DocumentType::Invitation => ("Invitation", self.invitation_lines(guest)),
            DocumentType::Itinerary => ("Itinerary", self.itinerary_lines(guest)),
        };
        let bytes = self.build(heading, &lines)?;
        tracing::debug!(guest_id = %guest.id, %document_type, size = bytes.len(), "rendered pdf");
        Ok(bytes)
    }
}

fn push_text(ops: &mut Vec<Operation>, size: f32, x: f32, y: f32, text: &str) {
    ops.push(Operation::new("BT", vec![]));
    ops.push(Operation::new("Tf", vec!["F1".into(), size.into()]));
    ops.push(Operation::new("Td", vec![x.into(), y.into()]));
    ops.push(Operation::new("Tj", vec![Object::string_literal(text)]));
    ops.push(Operation::new("ET", vec![]));
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
