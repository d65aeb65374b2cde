use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{RecError, Result};

pub type NewsId = u32;

/// Reserved sentinel for padded history slots. Real news ids start at 1.
pub const NO_HISTORY_ID: NewsId = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct News {
    pub id: NewsId,
    pub title: Vec<u32>,
    pub sapo: Vec<u32>,
    pub category: u32,
}

impl News {
    pub fn new(id: NewsId, title: Vec<u32>, sapo: Vec<u32>, category: u32) -> Self {
        Self {
            id,
            title,
            sapo,
            category,
        }
    }
}

/// A user's click history, always exactly `his_length` entries.
///
/// Convention: chronological order with the most recent click last,
/// left-padded with `NO_HISTORY_ID` when the user has fewer clicks.
/// The same convention is applied across training, evaluation and
/// serving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    ids: Vec<NewsId>,
}

impl History {
    pub fn new(clicked: &[NewsId], his_length: usize) -> Self {
        let keep = clicked.len().min(his_length);
        let mut ids = vec![NO_HISTORY_ID; his_length - keep];
        ids.extend_from_slice(&clicked[clicked.len() - keep..]);
        Self { ids }
    }

    pub fn ids(&self) -> &[NewsId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// True for slots holding a real click, false for padding.
    pub fn mask(&self) -> Vec<bool> {
        self.ids.iter().map(|&id| id != NO_HISTORY_ID).collect()
    }

    pub fn num_clicks(&self) -> usize {
        self.ids.iter().filter(|&&id| id != NO_HISTORY_ID).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub news_id: NewsId,
    pub clicked: bool,
}

impl Candidate {
    pub fn new(news_id: NewsId, clicked: bool) -> Self {
        Self { news_id, clicked }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Impression {
    pub id: u64,
    pub user_id: u64,
    pub history: History,
    pub candidates: Vec<Candidate>,
}

impl Impression {
    pub fn new(id: u64, user_id: u64, history: History, candidates: Vec<Candidate>) -> Self {
        Self {
            id,
            user_id,
            history,
            candidates,
        }
    }

    pub fn clicked_candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter().filter(|c| c.clicked)
    }

    pub fn non_clicked_candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter().filter(|c| !c.clicked)
    }
}

/// Read access to the news records behind ids. Tokenization and
/// padding happen upstream; the corpus only hands out finished
/// fixed-length sequences.
pub trait Corpus: Sync {
    fn news(&self, id: NewsId) -> Option<&News>;

    fn require(&self, id: NewsId) -> Result<&News> {
        self.news(id).ok_or(RecError::UnknownNews(id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCorpus {
    news: HashMap<NewsId, News>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, news: News) {
        self.news.insert(news.id, news);
    }

    pub fn len(&self) -> usize {
        self.news.len()
    }

    pub fn is_empty(&self) -> bool {
        self.news.is_empty()
    }
}

impl FromIterator<News> for InMemoryCorpus {
    fn from_iter<T: IntoIterator<Item = News>>(iter: T) -> Self {
        let mut corpus = Self::new();
        for news in iter {
            corpus.insert(news);
        }
        corpus
    }
}

impl Corpus for InMemoryCorpus {
    fn news(&self, id: NewsId) -> Option<&News> {
        self.news.get(&id)
    }
}

/// Access to logged impressions for training and evaluation.
pub trait BehaviorLog {
    fn impressions(&self) -> &[Impression];
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBehaviorLog {
    impressions: Vec<Impression>,
}

impl InMemoryBehaviorLog {
    pub fn new(impressions: Vec<Impression>) -> Self {
        Self { impressions }
    }

    pub fn push(&mut self, impression: Impression) {
        self.impressions.push(impression);
    }
}

impl BehaviorLog for InMemoryBehaviorLog {
    fn impressions(&self) -> &[Impression] {
        &self.impressions
    }
}
