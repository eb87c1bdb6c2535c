//! In-memory photo gallery owned by a single create/edit form.
//!
//! A draft is a cover slot plus an ordered list of additional slots. Every
//! mutation runs to completion synchronously; previews are attached later by
//! [`SlotId`] so index positions never drift while a preview is being read.

use crate::media::MediaFile;
use crate::notice::Notice;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on additional photos across every observed form.
pub const DEFAULT_MAX_ADDITIONAL: usize = 10;

/// Per-flow limits applied while editing a draft.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowLimits {
    /// Hard ceiling for a selected file; larger files never enter the draft.
    pub max_file_mb: f64,
    pub max_additional: usize,
}

impl Default for FlowLimits {
    fn default() -> Self {
        Self {
            max_file_mb: 10.0,
            max_additional: DEFAULT_MAX_ADDITIONAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotRole {
    Cover,
    Additional,
}

#[derive(Debug, Clone)]
pub enum SlotOrigin {
    /// Selected on this device, not uploaded yet.
    Local {
        file: MediaFile,
        preview: Option<String>,
    },
    /// Already hosted by the object store.
    Remote { url: String },
}

#[derive(Debug, Clone)]
pub struct MediaSlot {
    pub id: SlotId,
    pub role: SlotRole,
    pub origin: SlotOrigin,
}

impl MediaSlot {
    pub fn is_local(&self) -> bool {
        matches!(self.origin, SlotOrigin::Local { .. })
    }

    pub fn remote_url(&self) -> Option<&str> {
        match &self.origin {
            SlotOrigin::Remote { url } => Some(url),
            SlotOrigin::Local { .. } => None,
        }
    }

    pub fn local_file(&self) -> Option<&MediaFile> {
        match &self.origin {
            SlotOrigin::Local { file, .. } => Some(file),
            SlotOrigin::Remote { .. } => None,
        }
    }

    /// Something a UI can display: the preview for local slots, the URL for remote ones.
    pub fn display_ref(&self) -> Option<&str> {
        match &self.origin {
            SlotOrigin::Local { preview, .. } => preview.as_deref(),
            SlotOrigin::Remote { url } => Some(url),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum GalleryError {
    #[error("{file_name} is larger than {limit_mb} MB")]
    FileTooLarge { file_name: String, limit_mb: f64 },
    #[error("no photo at position {index} (gallery has {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

impl GalleryError {
    /// The toast to show for this rejection, when it is a per-file problem.
    pub fn notice(&self) -> Option<Notice> {
        match self {
            GalleryError::FileTooLarge {
                file_name,
                limit_mb,
            } => Some(Notice::FileTooLarge {
                file_name: file_name.clone(),
                limit_mb: *limit_mb,
            }),
            GalleryError::IndexOutOfRange { .. } => None,
        }
    }
}

/// Result of a batch add: the slots created (in input order) and per-file notices.
#[derive(Debug, Default, Clone)]
pub struct AddOutcome {
    pub accepted: Vec<SlotId>,
    pub notices: Vec<Notice>,
}

impl AddOutcome {
    pub fn limit_reached(&self) -> bool {
        self.notices
            .iter()
            .any(|n| matches!(n, Notice::LimitReached { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct GalleryDraft {
    limits: FlowLimits,
    cover: Option<MediaSlot>,
    additional: Vec<MediaSlot>,
    /// Remote URLs the draft was loaded with, for reporting deletions.
    loaded_urls: Vec<String>,
    next_id: u64,
}

impl GalleryDraft {
    pub fn new(limits: FlowLimits) -> Self {
        Self {
            limits,
            cover: None,
            additional: Vec::new(),
            loaded_urls: Vec::new(),
            next_id: 0,
        }
    }

    /// Draft for editing an existing entity; every slot starts out remote.
    pub fn from_existing(
        limits: FlowLimits,
        cover_url: Option<String>,
        additional_urls: Vec<String>,
    ) -> Self {
        let mut draft = Self::new(limits);
        if let Some(url) = cover_url.filter(|u| !u.is_empty()) {
            draft.loaded_urls.push(url.clone());
            let slot = draft.slot(SlotRole::Cover, SlotOrigin::Remote { url });
            draft.cover = Some(slot);
        }
        for url in additional_urls.into_iter().filter(|u| !u.is_empty()) {
            if draft.additional.len() >= limits.max_additional {
                tracing::warn!(
                    url = %url,
                    max = limits.max_additional,
                    "existing gallery exceeds additional photo limit; ignoring extra"
                );
                continue;
            }
            draft.loaded_urls.push(url.clone());
            let slot = draft.slot(SlotRole::Additional, SlotOrigin::Remote { url });
            draft.additional.push(slot);
        }
        draft
    }

    pub fn limits(&self) -> FlowLimits {
        self.limits
    }

    pub fn cover(&self) -> Option<&MediaSlot> {
        self.cover.as_ref()
    }

    pub fn additional(&self) -> &[MediaSlot] {
        &self.additional
    }

    pub fn is_empty(&self) -> bool {
        self.cover.is_none() && self.additional.is_empty()
    }

    fn slot(&mut self, role: SlotRole, origin: SlotOrigin) -> MediaSlot {
        let id = SlotId(self.next_id);
        self.next_id += 1;
        MediaSlot { id, role, origin }
    }

    fn local_slot(&mut self, role: SlotRole, file: MediaFile) -> MediaSlot {
        self.slot(
            role,
            SlotOrigin::Local {
                file,
                preview: None,
            },
        )
    }

    fn check_size(&self, file: &MediaFile) -> Result<(), GalleryError> {
        if file.exceeds_mb(self.limits.max_file_mb) {
            return Err(GalleryError::FileTooLarge {
                file_name: file.name.clone(),
                limit_mb: self.limits.max_file_mb,
            });
        }
        Ok(())
    }

    /// Replace the cover with a newly selected file. Oversized files leave the cover untouched.
    pub fn set_cover(&mut self, file: MediaFile) -> Result<SlotId, GalleryError> {
        self.check_size(&file)?;
        let slot = self.local_slot(SlotRole::Cover, file);
        let id = slot.id;
        self.cover = Some(slot);
        Ok(id)
    }

    /// Append files in order. Oversized files are skipped individually; once the
    /// additional list is full the whole remaining batch is rejected at once.
    /// On an empty draft the first accepted file becomes the cover.
    pub fn add_additional(&mut self, files: Vec<MediaFile>) -> AddOutcome {
        let mut outcome = AddOutcome::default();
        let mut files = files.into_iter();
        while let Some(file) = files.next() {
            if let Err(e) = self.check_size(&file) {
                tracing::debug!(file = %file.name, error = %e, "rejected oversized photo");
                outcome.notices.extend(e.notice());
                continue;
            }
            if self.is_empty() {
                let slot = self.local_slot(SlotRole::Cover, file);
                outcome.accepted.push(slot.id);
                self.cover = Some(slot);
                continue;
            }
            if self.additional.len() >= self.limits.max_additional {
                let rejected: Vec<String> = std::iter::once(file.name)
                    .chain(files.by_ref().map(|f| f.name))
                    .collect();
                tracing::debug!(
                    max = self.limits.max_additional,
                    rejected = rejected.len(),
                    "additional photo limit reached"
                );
                outcome.notices.push(Notice::LimitReached {
                    max: self.limits.max_additional,
                    rejected,
                });
                break;
            }
            let slot = self.local_slot(SlotRole::Additional, file);
            outcome.accepted.push(slot.id);
            self.additional.push(slot);
        }
        outcome
    }

    /// Remove the cover. The first additional photo, if any, is promoted in its place.
    pub fn remove_cover(&mut self) -> Option<MediaSlot> {
        let removed = self.cover.take();
        if !self.additional.is_empty() {
            let mut promoted = self.additional.remove(0);
            promoted.role = SlotRole::Cover;
            self.cover = Some(promoted);
        }
        removed
    }

    pub fn remove_additional(&mut self, index: usize) -> Result<MediaSlot, GalleryError> {
        self.check_index(index)?;
        Ok(self.additional.remove(index))
    }

    /// Swap a newly selected file into an existing additional position.
    pub fn replace_additional(
        &mut self,
        index: usize,
        file: MediaFile,
    ) -> Result<SlotId, GalleryError> {
        self.check_index(index)?;
        self.check_size(&file)?;
        let slot = self.local_slot(SlotRole::Additional, file);
        let id = slot.id;
        self.additional[index] = slot;
        Ok(id)
    }

    /// Promote `additional[index]` to cover; the old cover takes its position.
    pub fn swap_cover(&mut self, index: usize) -> Result<(), GalleryError> {
        self.check_index(index)?;
        let mut promoted = self.additional.remove(index);
        promoted.role = SlotRole::Cover;
        if let Some(mut demoted) = self.cover.replace(promoted) {
            demoted.role = SlotRole::Additional;
            self.additional.insert(index, demoted);
        }
        Ok(())
    }

    pub fn move_additional(&mut self, from: usize, to: usize) -> Result<(), GalleryError> {
        self.check_index(from)?;
        self.check_index(to)?;
        let slot = self.additional.remove(from);
        self.additional.insert(to, slot);
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<(), GalleryError> {
        if index >= self.additional.len() {
            return Err(GalleryError::IndexOutOfRange {
                index,
                len: self.additional.len(),
            });
        }
        Ok(())
    }

    /// Attach preview data once it has been read. Returns false when the slot is gone.
    pub fn attach_preview(&mut self, id: SlotId, data_url: String) -> bool {
        let slot = self
            .cover
            .iter_mut()
            .chain(self.additional.iter_mut())
            .find(|s| s.id == id);
        match slot {
            Some(MediaSlot {
                origin: SlotOrigin::Local { preview, .. },
                ..
            }) => {
                *preview = Some(data_url);
                true
            }
            _ => false,
        }
    }

    pub fn find(&self, id: SlotId) -> Option<&MediaSlot> {
        self.cover
            .iter()
            .chain(self.additional.iter())
            .find(|s| s.id == id)
    }

    /// Cover first (when present), then additional photos in display order.
    pub fn to_ordered_list(&self) -> Vec<&MediaSlot> {
        self.cover.iter().chain(self.additional.iter()).collect()
    }

    /// Previously published URLs no longer referenced by the draft.
    pub fn removed_urls(&self) -> Vec<&str> {
        let current: Vec<&str> = self
            .to_ordered_list()
            .into_iter()
            .filter_map(MediaSlot::remote_url)
            .collect();
        self.loaded_urls
            .iter()
            .map(String::as_str)
            .filter(|u| !current.contains(u))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, size: usize) -> MediaFile {
        MediaFile::new(name, Some("image/jpeg"), vec![0u8; size])
    }

    fn limits() -> FlowLimits {
        FlowLimits {
            max_file_mb: 1.0,
            max_additional: 10,
        }
    }

    fn names(draft: &GalleryDraft) -> Vec<String> {
        draft
            .to_ordered_list()
            .iter()
            .map(|s| match &s.origin {
                SlotOrigin::Local { file, .. } => file.name.clone(),
                SlotOrigin::Remote { url } => url.clone(),
            })
            .collect()
    }

    fn draft_with(cover: &str, additional: &[&str]) -> GalleryDraft {
        GalleryDraft::from_existing(
            limits(),
            Some(cover.to_string()),
            additional.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn remove_cover_promotes_first_additional() {
        let mut d = draft_with("A", &["B", "C"]);
        d.remove_cover();
        assert_eq!(d.cover().and_then(|s| s.remote_url()), Some("B"));
        assert_eq!(d.cover().map(|s| s.role), Some(SlotRole::Cover));
        assert_eq!(names(&d), vec!["B", "C"]);
        assert_eq!(d.additional().len(), 1);
    }

    #[test]
    fn remove_cover_without_additional_clears_it() {
        let mut d = draft_with("A", &[]);
        let removed = d.remove_cover();
        assert_eq!(removed.and_then(|s| s.remote_url().map(str::to_string)), Some("A".into()));
        assert!(d.cover().is_none());
        assert!(d.is_empty());
    }

    #[test]
    fn set_cover_rejects_oversized_and_keeps_previous() {
        let mut d = draft_with("A", &[]);
        let err = d.set_cover(file("huge.jpg", 2 * 1024 * 1024)).unwrap_err();
        assert!(matches!(err, GalleryError::FileTooLarge { .. }));
        assert_eq!(d.cover().and_then(|s| s.remote_url()), Some("A"));
        d.set_cover(file("new.jpg", 10)).unwrap();
        assert!(d.cover().is_some_and(|s| s.is_local()));
        assert_eq!(d.removed_urls(), vec!["A"]);
    }

    #[test]
    fn batch_overflow_rejects_only_the_remainder() {
        let nine: Vec<String> = (0..9).map(|i| format!("u{i}")).collect();
        let mut d = GalleryDraft::from_existing(limits(), Some("cover".into()), nine);
        let out = d.add_additional(vec![file("f1", 10), file("f2", 10), file("f3", 10)]);
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(d.additional().len(), 10);
        assert_eq!(
            out.notices,
            vec![Notice::LimitReached {
                max: 10,
                rejected: vec!["f2".into(), "f3".into()],
            }]
        );
        assert_eq!(names(&d).last().map(String::as_str), Some("f1"));
    }

    #[test]
    fn oversized_files_are_skipped_individually() {
        let mut d = draft_with("cover", &[]);
        let out = d.add_additional(vec![
            file("a", 10),
            file("big", 3 * 1024 * 1024),
            file("b", 10),
        ]);
        assert_eq!(out.accepted.len(), 2);
        assert_eq!(
            out.notices,
            vec![Notice::FileTooLarge {
                file_name: "big".into(),
                limit_mb: 1.0
            }]
        );
        assert!(!out.limit_reached());
        assert_eq!(names(&d), vec!["cover", "a", "b"]);
    }

    #[test]
    fn additional_never_exceeds_limit_across_calls() {
        let mut d = draft_with("cover", &[]);
        for round in 0..5 {
            let batch = (0..4).map(|i| file(&format!("r{round}-{i}"), 10)).collect();
            d.add_additional(batch);
            assert!(d.additional().len() <= 10);
        }
        assert_eq!(d.additional().len(), 10);
        assert_eq!(d.additional()[0].local_file().map(|f| f.name.as_str()), Some("r0-0"));
    }

    #[test]
    fn first_file_on_empty_draft_becomes_cover() {
        let mut d = GalleryDraft::new(limits());
        let out = d.add_additional(vec![file("first", 10), file("second", 10)]);
        assert_eq!(out.accepted.len(), 2);
        assert_eq!(d.cover().and_then(|s| s.local_file()).map(|f| f.name.as_str()), Some("first"));
        assert_eq!(names(&d), vec!["first", "second"]);
    }

    #[test]
    fn remove_additional_leaves_cover_alone() {
        let mut d = draft_with("A", &["B", "C"]);
        let removed = d.remove_additional(0).unwrap();
        assert_eq!(removed.remote_url(), Some("B"));
        assert_eq!(names(&d), vec!["A", "C"]);
        assert_eq!(d.removed_urls(), vec!["B"]);
        assert_eq!(
            d.remove_additional(5).unwrap_err(),
            GalleryError::IndexOutOfRange { index: 5, len: 1 }
        );
    }

    #[test]
    fn swap_cover_demotes_into_same_position() {
        let mut d = draft_with("A", &["B", "C", "D"]);
        d.swap_cover(1).unwrap();
        assert_eq!(names(&d), vec!["C", "B", "A", "D"]);
        assert_eq!(d.additional()[1].role, SlotRole::Additional);
        assert_eq!(d.cover().map(|s| s.role), Some(SlotRole::Cover));
    }

    #[test]
    fn replace_and_move_keep_order() {
        let mut d = draft_with("A", &["B", "C", "D"]);
        d.replace_additional(1, file("c2", 10)).unwrap();
        d.move_additional(0, 2).unwrap();
        assert_eq!(names(&d), vec!["A", "c2", "D", "B"]);
        assert!(d.replace_additional(9, file("x", 10)).is_err());
    }

    #[test]
    fn previews_attach_by_identity() {
        let mut d = GalleryDraft::new(limits());
        let out = d.add_additional(vec![file("a", 10), file("b", 10), file("c", 10)]);
        let (a, b, c) = (out.accepted[0], out.accepted[1], out.accepted[2]);
        d.remove_additional(0).unwrap();
        // preview for "c" resolves after "b" was removed
        assert!(d.attach_preview(c, "data:c".into()));
        assert!(!d.attach_preview(b, "data:b".into()));
        assert!(d.attach_preview(a, "data:a".into()));
        assert_eq!(d.additional()[0].display_ref(), Some("data:c"));
        assert_eq!(d.cover().and_then(|s| s.display_ref()), Some("data:a"));
        assert!(d.find(b).is_none());
    }
}
