use crate::core::config::LlmConfig;
use crate::core::error::{ConvertError, Result};
use crate::core::progress::{ProgressEvent, ProgressSink, Stage};
use crate::core::state::{Character, Gender, SpeakerAssignment, TextBlock, NARRATOR};
use crate::services::llm::{retry_unbounded, retry_with_limit, ChatRequest, LlmClient};
use crate::services::matcher::merge_same_characters;
use crate::services::prompts;
use crate::services::prompts::CodeBook;
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio_util::sync::CancellationToken;

/// Pause between sequential extract calls so slow endpoints are not hammered.
const EXTRACT_CALL_DELAY_MS: u64 = 500;

/// Number of parallel consensus votes in the merge stage.
const MERGE_VOTES: usize = 5;

/// A pair of character indices must co-occur in at least this many votes.
const MERGE_QUORUM: usize = 2;

/// Assign voting temperatures, coolest first; the first vote breaks ties.
const ASSIGN_VOTE_TEMPS: [f32; 3] = [0.1, 0.4, 0.7];

/// Attempts per voting call. A vote that keeps failing is dropped and the
/// remaining votes carry the consensus; outside voting, retries are
/// unbounded.
const MAX_VOTE_ATTEMPTS: usize = 4;

pub struct AnalysisPipeline<'a> {
    pub extract_llm: &'a dyn LlmClient,
    pub merge_llm: &'a dyn LlmClient,
    pub assign_llm: &'a dyn LlmClient,
    pub config: &'a LlmConfig,
    pub cancel: &'a CancellationToken,
    pub progress: &'a dyn ProgressSink,
}

impl<'a> AnalysisPipeline<'a> {
    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ConvertError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn report(&self, stage: Stage, current: usize, total: usize, message: String) {
        self.progress.report(ProgressEvent {
            stage,
            current,
            total,
            message,
        });
    }

    /// Stage 1: sequential per-block character extraction with a merge by
    /// canonical name at the end.
    pub async fn extract(&self, blocks: &[TextBlock]) -> Result<Vec<Character>> {
        let mut all: Vec<Character> = Vec::new();
        let repeat = self.config.extract.repeat_prompt;

        for (i, block) in blocks.iter().enumerate() {
            self.check_cancel()?;
            self.report(
                Stage::Extract,
                i,
                blocks.len(),
                format!("block {}/{}", i + 1, blocks.len()),
            );

            let known = merge_same_characters(all.clone());
            let llm = self.extract_llm;
            let found = retry_unbounded("extract", self.cancel, |last| {
                let prompt = prompts::extract_prompt(block, &known, &last, repeat);
                async move {
                    let schema = prompts::extract_schema();
                    let response = llm
                        .chat(ChatRequest {
                            system: prompts::extract_system(),
                            user: &prompt,
                            temperature: None,
                            schema: Some(&schema),
                        })
                        .await?;
                    prompts::parse_extract(&response)
                }
            })
            .await?;

            log::debug!("block {}: {} characters", i, found.len());
            all.extend(found);

            if i + 1 < blocks.len() {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(EXTRACT_CALL_DELAY_MS)) => {}
                    _ = self.cancel.cancelled() => return Err(ConvertError::Cancelled),
                }
            }
        }

        self.report(Stage::Extract, blocks.len(), blocks.len(), "done".into());
        Ok(merge_same_characters(all))
    }

    /// Stage 2: consensus merge over `MERGE_VOTES` parallel votes at random
    /// temperatures. Skipped when a single block produced the characters.
    pub async fn merge(
        &self,
        characters: Vec<Character>,
        block_count: usize,
    ) -> Result<Vec<Character>> {
        if block_count <= 1 || characters.len() <= 1 {
            return Ok(characters);
        }
        self.check_cancel()?;
        self.report(
            Stage::Merge,
            0,
            MERGE_VOTES,
            format!("{} candidates", characters.len()),
        );

        let temps: Vec<f32> = {
            let mut rng = rand::rng();
            (0..MERGE_VOTES).map(|_| rng.random_range(0.0..=1.0)).collect()
        };

        let repeat = self.config.merge.repeat_prompt;
        let count = characters.len();
        let characters_ref = &characters;
        let votes: Vec<Vec<Vec<usize>>> =
            futures_util::future::try_join_all(temps.into_iter().map(|temp| {
                let llm = self.merge_llm;
                async move {
                    retry_unbounded("merge", self.cancel, |last| {
                        let prompt = prompts::merge_prompt(characters_ref, &last, repeat);
                        async move {
                            let schema = prompts::merge_schema();
                            let response = llm
                                .chat(ChatRequest {
                                    system: prompts::merge_system(),
                                    user: &prompt,
                                    temperature: Some(temp),
                                    schema: Some(&schema),
                                })
                                .await?;
                            prompts::parse_merge(&response, count)
                        }
                    })
                    .await
                }
            }))
            .await?;

        self.report(Stage::Merge, MERGE_VOTES, MERGE_VOTES, "consensus".into());
        Ok(consensus_merge(&characters, &votes))
    }

    /// Stage 3: per-block speaker assignment, blocks running up to
    /// `llm_threads` in flight, voting sequential within a block. Voices are
    /// resolved later by the allocator; assignments leave here with the
    /// speaker name only.
    pub async fn assign(
        &self,
        blocks: &[TextBlock],
        characters: &[Character],
    ) -> Result<Vec<SpeakerAssignment>> {
        let codebook = CodeBook::new(characters);
        let total: usize = blocks.iter().map(|b| b.len()).sum();
        self.report(Stage::Assign, 0, blocks.len(), format!("{} lines", total));

        let codebook_ref = &codebook;
        let done = std::sync::atomic::AtomicUsize::new(0);
        let done_ref = &done;
        let results: Vec<Result<Vec<SpeakerAssignment>>> = stream::iter(blocks)
            .map(|block| async move {
                let out = self.assign_block(block, characters, codebook_ref).await;
                let n = done_ref.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                self.report(
                    Stage::Assign,
                    n,
                    blocks.len(),
                    format!("block {}/{}", n, blocks.len()),
                );
                out
            })
            .buffer_unordered(self.config.llm_threads.max(1))
            .collect()
            .await;

        let mut assignments = Vec::with_capacity(total);
        for r in results {
            assignments.extend(r?);
        }
        assignments.sort_by_key(|a| a.sentence_index);
        Ok(assignments)
    }

    async fn assign_block(
        &self,
        block: &TextBlock,
        characters: &[Character],
        codebook: &CodeBook,
    ) -> Result<Vec<SpeakerAssignment>> {
        self.check_cancel()?;
        let repeat = self.config.assign.repeat_prompt;
        let llm = self.assign_llm;
        let count = block.len();

        let call = |temp: Option<f32>, attempts: usize| {
            retry_with_limit("assign", self.cancel, attempts, move |last| {
                let prompt = prompts::assign_prompt(block, characters, codebook, &last, repeat);
                async move {
                    let schema = prompts::assign_schema();
                    let response = llm
                        .chat(ChatRequest {
                            system: prompts::assign_system(),
                            user: &prompt,
                            temperature: temp,
                            schema: Some(&schema),
                        })
                        .await?;
                    prompts::parse_assign(&response, count, codebook)
                }
            })
        };

        let map = if self.config.use_voting {
            let mut votes: Vec<HashMap<usize, char>> = Vec::new();
            for temp in ASSIGN_VOTE_TEMPS {
                match call(Some(temp), MAX_VOTE_ATTEMPTS).await {
                    Ok(v) => votes.push(v),
                    Err(ConvertError::Cancelled) => return Err(ConvertError::Cancelled),
                    Err(e) => {
                        log::warn!("assign vote at t={} failed for block {}: {}", temp, block.index, e)
                    }
                }
            }
            if votes.is_empty() {
                // All votes failed: the whole block reads as narration.
                HashMap::new()
            } else {
                majority_assign(&votes)
            }
        } else {
            call(None, usize::MAX).await?
        };

        Ok(block
            .paragraphs
            .iter()
            .enumerate()
            .map(|(rel, text)| {
                let speaker = map
                    .get(&rel)
                    .and_then(|code| codebook.speaker_for(*code))
                    .unwrap_or(NARRATOR)
                    .to_string();
                SpeakerAssignment {
                    sentence_index: block.start_sentence + rel,
                    text: text.clone(),
                    speaker,
                    voice: String::new(),
                }
            })
            .collect())
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb.max(ra)] = rb.min(ra);
        }
    }
}

/// Deterministic consensus over merge votes: pairs that co-occur in at
/// least `MERGE_QUORUM` votes are unioned; each group keeps the member with
/// the most first-position votes (ties to the lowest index), unions the
/// variations of the absorbed members, and takes the non-unknown majority
/// gender.
pub fn consensus_merge(characters: &[Character], votes: &[Vec<Vec<usize>>]) -> Vec<Character> {
    let n = characters.len();
    let mut pair_counts: HashMap<(usize, usize), usize> = HashMap::new();
    for vote in votes {
        let mut seen_in_vote: HashSet<(usize, usize)> = HashSet::new();
        for group in vote {
            for (i, &a) in group.iter().enumerate() {
                for &b in &group[i + 1..] {
                    let pair = (a.min(b), a.max(b));
                    if seen_in_vote.insert(pair) {
                        *pair_counts.entry(pair).or_insert(0) += 1;
                    }
                }
            }
        }
    }

    let mut uf = UnionFind::new(n);
    for (&(a, b), &count) in &pair_counts {
        if count >= MERGE_QUORUM {
            uf.union(a, b);
        }
    }

    let mut first_votes = vec![0usize; n];
    for vote in votes {
        for group in vote {
            if let Some(&first) = group.first() {
                first_votes[first] += 1;
            }
        }
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..n {
        groups.entry(uf.find(i)).or_default().push(i);
    }

    let mut absorbed_into: HashMap<usize, usize> = HashMap::new();
    for members in groups.values() {
        if members.len() < 2 {
            continue;
        }
        let keeper = *members
            .iter()
            .max_by(|a, b| {
                first_votes[**a]
                    .cmp(&first_votes[**b])
                    .then(b.cmp(a)) // lowest index wins ties
            })
            .expect("non-empty group");
        for &m in members {
            absorbed_into.insert(m, keeper);
        }
    }

    let mut out = Vec::new();
    for i in 0..n {
        let keeper = absorbed_into.get(&i).copied().unwrap_or(i);
        if keeper != i {
            continue;
        }
        let mut merged = characters[i].clone();
        // Path compression above left parent[i] pointing at the root key.
        if let Some(members) = groups.get(&uf.parent[i]) {
            let mut male = 0usize;
            let mut female = 0usize;
            for &m in members {
                if m != i {
                    merged.absorb(&characters[m]);
                }
                match characters[m].gender {
                    Gender::Male => male += 1,
                    Gender::Female => female += 1,
                    Gender::Unknown => {}
                }
            }
            merged.gender = if male > female {
                Gender::Male
            } else if female > male {
                Gender::Female
            } else if characters[i].gender.is_known() {
                characters[i].gender
            } else {
                merged.gender
            };
        }
        out.push(merged);
    }
    out
}

/// Per-index majority across assign votes; the first (coolest) vote breaks
/// ties. Absence counts as a narrator vote.
pub fn majority_assign(votes: &[HashMap<usize, char>]) -> HashMap<usize, char> {
    let keys: BTreeSet<usize> = votes.iter().flat_map(|v| v.keys().copied()).collect();
    let mut out = HashMap::new();

    for key in keys {
        let opinions: Vec<Option<char>> = votes.iter().map(|v| v.get(&key).copied()).collect();
        let mut counts: HashMap<Option<char>, usize> = HashMap::new();
        for o in &opinions {
            *counts.entry(*o).or_insert(0) += 1;
        }
        let best = counts.values().copied().max().unwrap_or(0);
        let winners: Vec<Option<char>> = counts
            .iter()
            .filter(|(_, c)| **c == best)
            .map(|(o, _)| *o)
            .collect();
        let decision = if winners.len() == 1 {
            winners[0]
        } else {
            opinions[0]
        };
        if let Some(code) = decision {
            out.insert(key, code);
        }
    }
    out
}
