use std::collections::HashMap;

/// Parse `ps -ef` output into a pid -> parent-pid map. Header and
/// non-numeric lines are skipped.
pub fn parse_process_table(out: &str) -> HashMap<u32, u32> {
    let mut pids = HashMap::new();
    for line in out.lines() {
        let info: Vec<&str> = line.split_whitespace().collect();
        if info.len() > 3 {
            if let (Ok(pid), Ok(ppid)) = (info[1].parse::<u32>(), info[2].parse::<u32>()) {
                pids.insert(pid, ppid);
            }
        }
    }
    pids
}

/// Breadth-first expansion of all descendants of `pid`, including `pid`
/// itself when present in the table. Parents come before their children,
/// so callers terminating a tree should walk the result in reverse.
pub fn descendants(pids: &HashMap<u32, u32>, pid: u32) -> Vec<u32> {
    let mut plist: Vec<u32> = Vec::new();
    let mut clist: Vec<u32> = Vec::new();
    if pids.contains_key(&pid) {
        clist.push(pid);
    }
    while !clist.is_empty() {
        let idx = plist.len();
        plist.extend(&clist);
        clist = Vec::new();
        for &parent in &plist[idx..] {
            for (&child, &ppid) in pids {
                if ppid == parent {
                    clist.push(child);
                }
            }
        }
    }
    plist
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS_OUTPUT: &str = "\
UID          PID    PPID  C STIME TTY          TIME CMD
root           1       0  0 09:00 ?        00:00:01 /sbin/init
tester       100       1  0 09:01 pts/0    00:00:00 sh -c run
tester       101     100  0 09:01 pts/0    00:00:00 sleep 30
tester       102     101  0 09:01 pts/0    00:00:00 sleep 5
tester       200       1  0 09:02 pts/1    00:00:00 bash
";

    #[test]
    fn parse_skips_header_and_keeps_pairs() {
        let pids = parse_process_table(PS_OUTPUT);
        assert_eq!(pids.get(&101), Some(&100));
        assert_eq!(pids.get(&1), Some(&0));
        assert_eq!(pids.len(), 5);
    }

    #[test]
    fn descendants_of_chain_includes_whole_tree() {
        let pids = parse_process_table(PS_OUTPUT);
        let mut found = descendants(&pids, 100);
        found.sort_unstable();
        assert_eq!(found, vec![100, 101, 102]);
    }

    #[test]
    fn descendants_are_parent_first() {
        let pids = parse_process_table(PS_OUTPUT);
        let found = descendants(&pids, 100);
        assert_eq!(found[0], 100);
        assert_eq!(*found.last().unwrap(), 102);
    }

    #[test]
    fn descendants_of_unknown_pid_is_empty() {
        let pids = parse_process_table(PS_OUTPUT);
        assert!(descendants(&pids, 999).is_empty());
    }

    #[test]
    fn descendants_of_leaf_is_just_the_leaf() {
        let pids = parse_process_table(PS_OUTPUT);
        assert_eq!(descendants(&pids, 200), vec![200]);
    }
}
