use anyhow::Result;
use serde::Serialize;
use typix_contracts::models::{reference_limit, Ability, ModelSpec};

use crate::store::{ChatStore, FileStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    UserSupplied,
    History,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReferences {
    /// Data URIs in the order they go to the provider.
    pub images: Vec<String>,
    pub source: ReferenceSource,
    /// Prior result files chained in; empty unless `source` is `History`.
    pub file_ids: Vec<String>,
}

impl ResolvedReferences {
    fn none() -> Self {
        Self {
            images: Vec::new(),
            source: ReferenceSource::None,
            file_ids: Vec::new(),
        }
    }
}

/// Input for one resolution pass.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceQuery<'a> {
    pub chat_id: &'a str,
    pub user_id: &'a str,
    pub model: &'a ModelSpec,
    pub user_images: &'a [String],
    /// The assistant message being generated, never its own reference.
    pub exclude_message_id: Option<&'a str>,
}

/// Chooses the images a generation is conditioned on.
///
/// Uploads on the triggering message always win and are passed through untouched. Otherwise
/// image-capable models chain the newest prior result set of the chat, trimmed to the model's
/// input limit.
pub fn resolve_reference_images(
    store: &dyn ChatStore,
    files: &dyn FileStore,
    query: ReferenceQuery<'_>,
) -> Result<ResolvedReferences> {
    if !query.user_images.is_empty() {
        return Ok(ResolvedReferences {
            images: query.user_images.to_vec(),
            source: ReferenceSource::UserSupplied,
            file_ids: Vec::new(),
        });
    }
    if query.model.ability == Ability::T2i {
        return Ok(ResolvedReferences::none());
    }
    let Some(previous) = store.latest_result_files(query.chat_id, query.exclude_message_id)? else {
        return Ok(ResolvedReferences::none());
    };

    let file_ids = tail(&previous, reference_limit(query.model)).to_vec();
    let mut images = Vec::with_capacity(file_ids.len());
    for file_id in &file_ids {
        if let Some(image) = files.read(file_id, query.user_id)? {
            images.push(image);
        }
    }
    if images.is_empty() {
        return Ok(ResolvedReferences::none());
    }
    Ok(ResolvedReferences {
        images,
        source: ReferenceSource::History,
        file_ids,
    })
}

/// The last `limit` entries, oldest first.
fn tail(items: &[String], limit: usize) -> &[String] {
    &items[items.len().saturating_sub(limit)..]
}

#[cfg(test)]
mod tests {
    use typix_contracts::chat::{Chat, Generation, Message, MessageType};
    use typix_contracts::models::ModelSpec;

    use super::{resolve_reference_images, tail, ReferenceQuery, ReferenceSource};
    use crate::data_uri;
    use crate::store::{ChatStore, FileStore, MemoryFileStore, MemoryStore};

    struct Fixture {
        store: MemoryStore,
        files: MemoryFileStore,
        chat: Chat,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let store = MemoryStore::new();
            let chat = Chat::new("user-1", None, "dryrun", "dryrun-i2i");
            store.insert_chat(chat.clone())?;
            Ok(Self {
                store,
                files: MemoryFileStore::new(),
                chat,
            })
        }

        fn image(&self, marker: u8) -> String {
            data_uri::encode(&[0x89, b'P', b'N', b'G', marker], "image/png")
        }

        fn completed_turn(&self, markers: &[u8]) -> anyhow::Result<(Message, Vec<String>)> {
            let images = markers
                .iter()
                .map(|marker| self.image(*marker))
                .collect::<Vec<String>>();
            let file_ids = self.files.save(&images, "user-1")?;
            let mut generation = Generation::pending("user-1", "p", "dryrun", "dryrun-i2i");
            generation.complete(file_ids.clone(), 5)?;
            let message = Message::assistant_image(&self.chat.id, "user-1", &generation.id);
            self.store.insert_generation_turn(generation, message.clone())?;
            Ok((message, file_ids))
        }

        fn resolve(
            &self,
            model: &ModelSpec,
            user_images: &[String],
            exclude: Option<&str>,
        ) -> anyhow::Result<super::ResolvedReferences> {
            resolve_reference_images(
                &self.store,
                &self.files,
                ReferenceQuery {
                    chat_id: &self.chat.id,
                    user_id: "user-1",
                    model,
                    user_images,
                    exclude_message_id: exclude,
                },
            )
        }
    }

    #[test]
    fn single_input_model_chains_last_file_of_latest_result() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let (_, files_a) = fixture.completed_turn(&[1, 2])?;
        fixture.store.insert_message(Message::user(
            &fixture.chat.id,
            "user-1",
            "now with my upload",
            MessageType::Image,
        ))?;

        let model = ModelSpec::i2i("edit", "Edit");
        let resolved = fixture.resolve(&model, &[], None)?;
        assert_eq!(resolved.source, ReferenceSource::History);
        assert_eq!(resolved.file_ids, vec![files_a[1].clone()]);
        assert_eq!(resolved.images, vec![fixture.image(2)]);

        let upload = fixture.image(9);
        let explicit = fixture.resolve(&model, std::slice::from_ref(&upload), None)?;
        assert_eq!(explicit.source, ReferenceSource::UserSupplied);
        assert_eq!(explicit.images, vec![upload]);
        Ok(())
    }

    #[test]
    fn multi_input_model_takes_tail_in_order() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let (_, files) = fixture.completed_turn(&[1, 2, 3])?;
        let model = ModelSpec::i2i("edit", "Edit").with_max_input_images(2);
        let resolved = fixture.resolve(&model, &[], None)?;
        assert_eq!(resolved.file_ids, files[1..].to_vec());
        assert_eq!(resolved.images, vec![fixture.image(2), fixture.image(3)]);
        Ok(())
    }

    #[test]
    fn regeneration_skips_its_own_message() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.completed_turn(&[1])?;
        let (own, _) = fixture.completed_turn(&[2])?;
        let model = ModelSpec::i2i("edit", "Edit");
        let resolved = fixture.resolve(&model, &[], Some(own.id.as_str()))?;
        assert_eq!(resolved.images, vec![fixture.image(1)]);
        Ok(())
    }

    #[test]
    fn text_only_models_and_empty_chats_get_nothing() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let model = ModelSpec::i2i("edit", "Edit");
        assert_eq!(fixture.resolve(&model, &[], None)?.source, ReferenceSource::None);

        fixture.completed_turn(&[1])?;
        let t2i = ModelSpec::t2i("draw", "Draw");
        let resolved = fixture.resolve(&t2i, &[], None)?;
        assert_eq!(resolved.source, ReferenceSource::None);
        assert!(resolved.images.is_empty());
        Ok(())
    }

    #[test]
    fn files_missing_from_storage_are_skipped() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let mut generation = Generation::pending("user-1", "p", "dryrun", "dryrun-i2i");
        let kept = fixture.files.save(&[fixture.image(4)], "user-1")?;
        generation.complete(vec!["gone".to_string(), kept[0].clone()], 1)?;
        let message = Message::assistant_image(&fixture.chat.id, "user-1", &generation.id);
        fixture.store.insert_generation_turn(generation, message)?;

        let model = ModelSpec::i2i("edit", "Edit").with_max_input_images(2);
        let resolved = fixture.resolve(&model, &[], None)?;
        assert_eq!(resolved.images, vec![fixture.image(4)]);
        Ok(())
    }

    #[test]
    fn tail_keeps_order() {
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(tail(&items, 2), ["b", "c"]);
        assert_eq!(tail(&items, 5), ["a", "b", "c"]);
    }
}
